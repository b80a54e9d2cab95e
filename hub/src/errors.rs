use crate::model::Topic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The topic has never been published. Not a failure: callers render it
    /// as a loading state.
    #[error("Topic {0} has not been initialized yet")]
    Uninitialized(Topic),

    #[error("Invalid control configuration: {0}")]
    InvalidConfig(String),

    #[error("State store unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Subscription {0} is broken")]
    SubscriptionBroken(uuid::Uuid),

    #[error("Authentication failed: {0}")]
    Auth(#[from] crate::auth::AuthError),

    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
