use crate::errors::{Error, Result};
use crate::model::{ControlConfig, PumpCycle};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Durable home of the committed control configuration.
#[async_trait]
pub trait ControlBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Last saved configuration, if any was ever committed.
    async fn load(&self) -> Result<Option<ControlConfig>>;

    /// Atomically replaces the saved configuration.
    async fn save(&self, config: &ControlConfig) -> Result<()>;
}

/// Keeps the configuration in process memory only. Used when no database is
/// configured and in tests.
#[derive(Default)]
pub struct MemoryBackend {
    saved: Mutex<Option<ControlConfig>>,
}

#[async_trait]
impl ControlBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self) -> Result<Option<ControlConfig>> {
        Ok(self.saved.lock().await.clone())
    }

    async fn save(&self, config: &ControlConfig) -> Result<()> {
        *self.saved.lock().await = Some(config.clone());
        Ok(())
    }
}

pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = make_pool(database_url).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ControlBackend for PgBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn load(&self) -> Result<Option<ControlConfig>> {
        let mut attempts = 0;
        let max_attempts = 5;

        // Reads are idempotent, so transient failures at startup are retried
        loop {
            attempts += 1;
            match load_controls(&self.pool).await {
                Ok(config) => return Ok(config),
                Err(Error::Database(db_err))
                    if attempts < max_attempts && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Loading controls failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, max_attempts, wait_ms, db_err
                    );
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Loading controls failed after {} attempts: {}", attempts, e);
                    return Err(e);
                }
            }
        }
    }

    async fn save(&self, config: &ControlConfig) -> Result<()> {
        // Commits are never retried here; the operator resubmits
        save_controls(&self.pool, config).await
    }
}

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, sqlx::FromRow)]
struct ControlRow {
    temp_range: f64,
    ph_range: f64,
    pump_on_for: i64,
    pump_off_for: i64,
    nutrient_pump_running_time: i64,
}

impl From<ControlRow> for ControlConfig {
    fn from(row: ControlRow) -> Self {
        ControlConfig {
            temp_range: row.temp_range,
            ph_range: row.ph_range,
            pump_cycle: PumpCycle {
                on_for: row.pump_on_for,
                off_for: row.pump_off_for,
            },
            nutrient_pump_running_time: row.nutrient_pump_running_time,
        }
    }
}

async fn load_controls(pool: &PgPool) -> Result<Option<ControlConfig>> {
    let row = sqlx::query_as::<_, ControlRow>(
        r#"
        SELECT temp_range, ph_range, pump_on_for, pump_off_for, nutrient_pump_running_time
        FROM system_controls
        WHERE id = 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(ControlConfig::from))
}

async fn save_controls(pool: &PgPool, config: &ControlConfig) -> Result<()> {
    let query = r#"
        INSERT INTO system_controls
            (id, temp_range, ph_range, pump_on_for, pump_off_for, nutrient_pump_running_time, committed_at)
        VALUES (1, $1, $2, $3, $4, $5, now())
        ON CONFLICT (id) DO UPDATE SET
            temp_range = EXCLUDED.temp_range,
            ph_range = EXCLUDED.ph_range,
            pump_on_for = EXCLUDED.pump_on_for,
            pump_off_for = EXCLUDED.pump_off_for,
            nutrient_pump_running_time = EXCLUDED.nutrient_pump_running_time,
            committed_at = EXCLUDED.committed_at
        "#;

    sqlx::query(query)
        .bind(config.temp_range)
        .bind(config.ph_range)
        .bind(config.pump_cycle.on_for)
        .bind(config.pump_cycle.off_for)
        .bind(config.nutrient_pump_running_time)
        .execute(pool)
        .await?;

    Ok(())
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATE codes
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_round_trip() {
        tokio_test::block_on(async {
            let backend = MemoryBackend::default();
            assert!(backend.load().await.unwrap().is_none());

            let config = ControlConfig {
                temp_range: 23.0,
                ph_range: 5.8,
                pump_cycle: PumpCycle {
                    on_for: 15,
                    off_for: 120,
                },
                nutrient_pump_running_time: 90,
            };
            backend.save(&config).await.unwrap();
            assert_eq!(backend.load().await.unwrap(), Some(config));
        });
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_error(&sqlx::Error::PoolClosed));
        assert!(!is_transient_error(&sqlx::Error::RowNotFound));
    }
}
