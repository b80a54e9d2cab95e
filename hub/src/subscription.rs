use crate::errors::{Error, Result};
use crate::metrics::{ACTIVE_SUBSCRIPTIONS, BROKEN_SUBSCRIPTIONS_TOTAL, DELIVERIES_TOTAL};
use crate::model::{
    ControlConfig, Slot, StreamState, TelemetrySnapshot, Topic, TopicValue,
};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque handle identifying who opened a subscription or submitted a
/// commit. Only used for logging and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Caller(String);

impl Caller {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One value handed to an observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub topic: Topic,
    #[serde(flatten)]
    pub slot: Slot<TopicValue>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: Uuid,
    pub topic: Topic,
    pub caller: Caller,
    pub created_at: DateTime<Utc>,
}

enum Feed {
    Metrics(watch::Receiver<Slot<TelemetrySnapshot>>),
    Controls(watch::Receiver<Slot<ControlConfig>>),
    Stream(watch::Receiver<Slot<StreamState>>),
}

impl Feed {
    fn open(store: &StateStore, topic: Topic) -> Self {
        match topic {
            Topic::Metrics => Feed::Metrics(store.metrics().watch()),
            Topic::Controls => Feed::Controls(store.controls().watch()),
            Topic::Stream => Feed::Stream(store.stream().watch()),
        }
    }

    async fn changed(&mut self) -> std::result::Result<(), watch::error::RecvError> {
        match self {
            Feed::Metrics(rx) => rx.changed().await,
            Feed::Controls(rx) => rx.changed().await,
            Feed::Stream(rx) => rx.changed().await,
        }
    }

    fn has_changed(&self) -> std::result::Result<bool, watch::error::RecvError> {
        match self {
            Feed::Metrics(rx) => rx.has_changed(),
            Feed::Controls(rx) => rx.has_changed(),
            Feed::Stream(rx) => rx.has_changed(),
        }
    }

    /// Latest value, marking it seen.
    fn take(&mut self) -> Slot<TopicValue> {
        match self {
            Feed::Metrics(rx) => rx.borrow_and_update().clone().map(TopicValue::Metrics),
            Feed::Controls(rx) => rx.borrow_and_update().clone().map(TopicValue::Controls),
            Feed::Stream(rx) => rx.borrow_and_update().clone().map(TopicValue::Stream),
        }
    }
}

type Registry = Arc<Mutex<HashMap<Uuid, SubscriptionInfo>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<Uuid, SubscriptionInfo>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hands out independent subscriptions on top of the state store.
///
/// Each subscription holds its own watch receiver, so a slow observer only
/// ever lags to the latest value and never holds up a publisher or another
/// observer.
#[derive(Clone)]
pub struct SubscriptionService {
    store: StateStore,
    registry: Registry,
}

impl SubscriptionService {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Opens a subscription. The first `next()` yields the value current at
    /// the time of this call, even when nothing has been published since.
    pub fn subscribe(&self, topic: Topic, caller: Caller) -> Subscription {
        let id = Uuid::new_v4();
        let mut feed = Feed::open(&self.store, topic);
        let snapshot = feed.take();

        lock(&self.registry).insert(
            id,
            SubscriptionInfo {
                id,
                topic,
                caller: caller.clone(),
                created_at: Utc::now(),
            },
        );
        ACTIVE_SUBSCRIPTIONS.inc();
        info!("Subscription {} opened on {} by {}", id, topic, caller);

        Subscription {
            id,
            topic,
            caller,
            feed,
            pending: Some(snapshot),
            last_revision: 0,
            registry: self.registry.clone(),
        }
    }

    pub fn active_count(&self) -> usize {
        lock(&self.registry).len()
    }
}

pub struct Subscription {
    id: Uuid,
    topic: Topic,
    caller: Caller,
    feed: Feed,
    pending: Option<Slot<TopicValue>>,
    last_revision: u64,
    registry: Registry,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Waits for the next value. Intermediate values published while the
    /// caller was busy are skipped; only the newest one is delivered.
    pub async fn next(&mut self) -> Result<Delivery> {
        if let Some(slot) = self.pending.take() {
            return Ok(self.deliver(slot));
        }

        if self.feed.changed().await.is_err() {
            return Err(self.broken());
        }
        let slot = self.feed.take();
        Ok(self.deliver(slot))
    }

    /// Returns the next value if one is ready without waiting.
    pub fn try_next(&mut self) -> Result<Option<Delivery>> {
        if let Some(slot) = self.pending.take() {
            return Ok(Some(self.deliver(slot)));
        }

        match self.feed.has_changed() {
            Ok(true) => {
                let slot = self.feed.take();
                Ok(Some(self.deliver(slot)))
            }
            Ok(false) => Ok(None),
            Err(_) => Err(self.broken()),
        }
    }

    /// Releases the subscription. No delivery happens after this returns.
    pub fn unsubscribe(self) {
        debug!("Subscription {} unsubscribed by {}", self.id, self.caller);
    }

    /// Records that delivery to the observer failed. The subscription is
    /// dropped and must be re-established by its owner.
    pub fn mark_broken(self, reason: &str) -> Error {
        warn!("Subscription {} on {} broken: {}", self.id, self.topic, reason);
        BROKEN_SUBSCRIPTIONS_TOTAL.inc();
        Error::SubscriptionBroken(self.id)
    }

    fn deliver(&mut self, slot: Slot<TopicValue>) -> Delivery {
        let revision = slot.revision();
        debug_assert!(revision >= self.last_revision);
        self.last_revision = revision;
        DELIVERIES_TOTAL.inc();
        Delivery {
            topic: self.topic,
            slot,
        }
    }

    fn broken(&self) -> Error {
        warn!("Subscription {} on {} lost its source", self.id, self.topic);
        BROKEN_SUBSCRIPTIONS_TOTAL.inc();
        Error::SubscriptionBroken(self.id)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if lock(&self.registry).remove(&self.id).is_some() {
            ACTIVE_SUBSCRIPTIONS.dec();
            info!("Subscription {} on {} closed", self.id, self.topic);
        }
    }
}
