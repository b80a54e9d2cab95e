use crate::errors::{Error, Result};
use crate::metrics::{set_stream_live, INGEST_FAILURES_TOTAL, INGEST_MESSAGES_TOTAL};
use crate::model::{StreamState, TelemetrySnapshot, Topic, TopicValue};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Update published by the field device or the camera agent.
#[derive(Debug, Clone)]
pub enum IngestUpdate {
    Metrics(TelemetrySnapshot),
    Stream {
        payload: Vec<u8>,
        received_at: DateTime<Utc>,
    },
}

impl IngestUpdate {
    pub fn topic(&self) -> Topic {
        match self {
            IngestUpdate::Metrics(_) => Topic::Metrics,
            IngestUpdate::Stream { .. } => Topic::Stream,
        }
    }

    fn into_value(self) -> TopicValue {
        match self {
            IngestUpdate::Metrics(snapshot) => TopicValue::Metrics(snapshot),
            IngestUpdate::Stream {
                payload,
                received_at,
            } => TopicValue::Stream(StreamState::from_payload(&payload, received_at)),
        }
    }
}

/// Entry point for sensor and camera updates.
///
/// Values are passed through uninterpreted. Publishing never reports a
/// failure to the publisher: failed writes are logged and counted.
#[derive(Clone)]
pub struct IngestChannel {
    store: StateStore,
}

impl IngestChannel {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Writes the update and fans it out to current subscribers. Returns the
    /// committed revision, or `None` when the update was dropped.
    pub async fn publish(&self, update: IngestUpdate) -> Option<u64> {
        INGEST_MESSAGES_TOTAL.inc();
        let topic = update.topic();

        match self.publish_with_retry(update).await {
            Ok(revision) => Some(revision),
            Err(e) => {
                INGEST_FAILURES_TOTAL.inc();
                error!("Dropping {} update after retries: {}", topic, e);
                None
            }
        }
    }

    /// Single attempt, reporting the failure to the caller.
    pub fn try_publish(&self, update: IngestUpdate) -> Result<u64> {
        let value = update.into_value();
        let live = match &value {
            TopicValue::Stream(state) => Some(state.live),
            _ => None,
        };

        let revision = self.store.put(value)?;
        if let Some(live) = live {
            set_stream_live(live);
        }
        Ok(revision)
    }

    async fn publish_with_retry(&self, update: IngestUpdate) -> Result<u64> {
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            attempt += 1;

            match self.try_publish(update.clone()) {
                Ok(revision) => {
                    if attempt > 1 {
                        info!("Update published successfully on attempt {}", attempt);
                    } else {
                        debug!("Published {} revision {}", update.topic(), revision);
                    }
                    return Ok(revision);
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES || !is_retryable_error(&e) {
                        return Err(e);
                    }

                    warn!(
                        "Publishing {} failed (attempt {}/{}): {}. Retrying in {}ms...",
                        update.topic(),
                        attempt,
                        MAX_RETRIES,
                        e,
                        backoff_ms
                    );

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }
}

/// Telemetry writes are idempotent, so only store availability is retried.
fn is_retryable_error(error: &Error) -> bool {
    matches!(error, Error::TransportUnavailable(_))
}
