use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_addr: String,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic_prefix: String,
    /// Unset means control commits are kept in memory only.
    pub database_url: Option<String>,
    pub stream_stale_after: Duration,
    pub liveness_check_interval: Duration,
    pub operator_username: String,
    pub operator_password: String,
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            mqtt_broker: env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: env_or("MQTT_PORT", 1883),
            mqtt_topic_prefix: env::var("MQTT_TOPIC_PREFIX")
                .unwrap_or_else(|_| "aeroponics".to_string()),
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            stream_stale_after: Duration::from_secs(env_or("STREAM_STALE_AFTER_SECS", 30)),
            liveness_check_interval: Duration::from_millis(nonzero_or("LIVENESS_CHECK_MS", 1000)),
            operator_username: env::var("OPERATOR_USERNAME").unwrap_or_else(|_| "admin".to_string()),
            operator_password: env::var("OPERATOR_PASSWORD").unwrap_or_else(|_| "admin".to_string()),
            session_ttl: Duration::from_secs(env_or("SESSION_TTL_SECS", 12 * 60 * 60)),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like `env_or`, for periods that must not be zero.
fn nonzero_or(key: &str, default: u64) -> u64 {
    match env_or(key, default) {
        0 => {
            warn!("{} must be greater than zero, using {}", key, default);
            default
        }
        v => v,
    }
}
