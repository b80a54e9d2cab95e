use anyhow::Context;
use axum::{routing::get, Router};
use hub::auth::AuthGate;
use hub::commit::CommitService;
use hub::config::Config;
use hub::db::{ControlBackend, MemoryBackend, PgBackend};
use hub::ingest::IngestChannel;
use hub::model::Topic;
use hub::mqtt::{self, MqttSettings};
use hub::rest::{self, AppState};
use hub::store::StateStore;
use hub::subscription::{Caller, SubscriptionService};
use hub::{liveness, metrics};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting aeroponics hub");
    info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    info!("MQTT topic prefix: {}", config.mqtt_topic_prefix);
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Stream goes offline after {:?} without frames",
        config.stream_stale_after
    );

    metrics::init_metrics();

    let backend: Arc<dyn ControlBackend> = match &config.database_url {
        Some(url) => {
            info!("Database: {}", url.split('@').last().unwrap_or("***"));
            Arc::new(
                PgBackend::connect(url)
                    .await
                    .context("failed to connect to database")?,
            )
        }
        None => {
            warn!("DATABASE_URL not set, control commits will not survive a restart");
            Arc::new(MemoryBackend::default())
        }
    };

    let store = StateStore::new();
    let subscriptions = SubscriptionService::new(store.clone());
    let commits = Arc::new(CommitService::new(store.clone(), backend));
    commits
        .restore()
        .await
        .context("failed to restore control configuration")?;

    let ingest = IngestChannel::new(store.clone());
    let session_ttl = chrono::Duration::from_std(config.session_ttl)
        .ok()
        .filter(|ttl| chrono::Utc::now().checked_add_signed(*ttl).is_some())
        .context("SESSION_TTL_SECS out of range")?;
    let auth = Arc::new(AuthGate::new(
        config.operator_username.clone(),
        config.operator_password.clone(),
        session_ttl,
    ));

    // Bridge device, camera and control traffic over MQTT
    let settings = MqttSettings {
        broker: config.mqtt_broker.clone(),
        port: config.mqtt_port,
        client_id: format!("hub-{}", uuid::Uuid::new_v4()),
        topic_prefix: config.mqtt_topic_prefix.clone(),
    };
    let controls_feed = subscriptions.subscribe(Topic::Controls, Caller::new("mqtt-bridge"));
    let mqtt_ingest = ingest.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt::run_mqtt(settings, mqtt_ingest, controls_feed).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let liveness_handle = tokio::spawn(liveness::run_liveness_monitor(
        store.clone(),
        config.stream_stale_after,
        config.liveness_check_interval,
    ));

    let state = AppState {
        store: store.clone(),
        subscriptions,
        commits,
        ingest,
        auth,
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = liveness_handle => {
            error!("Liveness monitor terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    store.close();
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

async fn health_handler() -> &'static str {
    "ok"
}
