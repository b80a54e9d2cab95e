use crate::errors::{Error, Result};
use crate::model::{
    ControlConfig, Slot, StreamState, TelemetrySnapshot, Topic, TopicValue, Versioned,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Latest value of a single topic.
///
/// Writes go through the watch sender's lock, so two puts on the same topic
/// never interleave and each one replaces the whole value.
pub struct TopicCell<T> {
    topic: Topic,
    tx: watch::Sender<Slot<T>>,
}

impl<T: Clone> TopicCell<T> {
    fn new(topic: Topic) -> Self {
        let (tx, _rx) = watch::channel(Slot::Uninitialized);
        Self { topic, tx }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn get(&self) -> Slot<T> {
        self.tx.borrow().clone()
    }

    /// New receiver positioned at the current value.
    pub fn watch(&self) -> watch::Receiver<Slot<T>> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn put(&self, value: T) -> u64 {
        let mut revision = 0;
        self.tx.send_modify(|slot| {
            revision = slot.revision() + 1;
            *slot = Slot::Ready(Versioned {
                revision,
                updated_at: Utc::now(),
                value,
            });
        });
        revision
    }

    fn put_if_revision(&self, expected: u64, value: T) -> Option<u64> {
        let mut committed = None;
        self.tx.send_if_modified(|slot| {
            if slot.revision() != expected {
                return false;
            }
            let revision = expected + 1;
            *slot = Slot::Ready(Versioned {
                revision,
                updated_at: Utc::now(),
                value,
            });
            committed = Some(revision);
            true
        });
        committed
    }
}

struct Inner {
    metrics: TopicCell<TelemetrySnapshot>,
    controls: TopicCell<ControlConfig>,
    stream: TopicCell<StreamState>,
    closed: AtomicBool,
}

/// Single owner of the canonical telemetry, control and stream values.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                metrics: TopicCell::new(Topic::Metrics),
                controls: TopicCell::new(Topic::Controls),
                stream: TopicCell::new(Topic::Stream),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn metrics(&self) -> &TopicCell<TelemetrySnapshot> {
        &self.inner.metrics
    }

    pub fn controls(&self) -> &TopicCell<ControlConfig> {
        &self.inner.controls
    }

    pub fn stream(&self) -> &TopicCell<StreamState> {
        &self.inner.stream
    }

    pub fn get(&self, topic: Topic) -> Slot<TopicValue> {
        match topic {
            Topic::Metrics => self.inner.metrics.get().map(TopicValue::Metrics),
            Topic::Controls => self.inner.controls.get().map(TopicValue::Controls),
            Topic::Stream => self.inner.stream.get().map(TopicValue::Stream),
        }
    }

    /// Commits `value` as the new current value of its topic and returns the
    /// assigned revision.
    pub fn put(&self, value: TopicValue) -> Result<u64> {
        self.ensure_open()?;
        let topic = value.topic();
        let revision = match value {
            TopicValue::Metrics(v) => self.inner.metrics.put(v),
            TopicValue::Controls(v) => self.inner.controls.put(v),
            TopicValue::Stream(v) => self.inner.stream.put(v),
        };
        debug!("Committed {} revision {}", topic, revision);
        Ok(revision)
    }

    pub fn put_metrics(&self, snapshot: TelemetrySnapshot) -> Result<u64> {
        self.put(TopicValue::Metrics(snapshot))
    }

    pub fn put_controls(&self, config: ControlConfig) -> Result<u64> {
        self.put(TopicValue::Controls(config))
    }

    pub fn put_stream(&self, state: StreamState) -> Result<u64> {
        self.put(TopicValue::Stream(state))
    }

    /// Replaces the stream state only if nothing was published since
    /// `expected` was read. Returns the new revision when the write happened.
    pub fn put_stream_if_revision(&self, expected: u64, state: StreamState) -> Result<Option<u64>> {
        self.ensure_open()?;
        Ok(self.inner.stream.put_if_revision(expected, state))
    }

    /// Rejects further writes. Existing values stay readable.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("State store closed for writes");
        }
    }

    /// Fails with `TransportUnavailable` once the store is closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::TransportUnavailable(
                "state store is shut down".to_string(),
            ));
        }
        Ok(())
    }
}
