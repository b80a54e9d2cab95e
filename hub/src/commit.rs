use crate::db::ControlBackend;
use crate::errors::{Error, Result};
use crate::metrics::{
    COMMITS_REJECTED_TOTAL, COMMITS_TOTAL, COMMIT_FAILURES_TOTAL, COMMIT_LATENCY_SECONDS,
};
use crate::model::ControlConfig;
use crate::store::StateStore;
use crate::subscription::Caller;
use crate::validate::validate;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    Idle,
    Validating,
    Committing,
    Committed,
    Rejected,
}

impl CommitPhase {
    pub fn can_advance_to(self, next: CommitPhase) -> bool {
        use CommitPhase::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Committing)
                | (Validating, Rejected)
                | (Committing, Committed)
                | (Committing, Rejected)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommitPhase::Committed | CommitPhase::Rejected)
    }
}

struct Submission<'a> {
    caller: &'a Caller,
    phase: CommitPhase,
}

impl<'a> Submission<'a> {
    fn new(caller: &'a Caller) -> Self {
        Self {
            caller,
            phase: CommitPhase::Idle,
        }
    }

    fn advance(&mut self, next: CommitPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal commit transition {:?} -> {:?}",
            self.phase,
            next
        );
        debug!("Commit by {}: {:?} -> {:?}", self.caller, self.phase, next);
        self.phase = next;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Committed {
    pub revision: u64,
    pub config: ControlConfig,
}

/// Validates and commits operator control changes.
///
/// Concurrent submissions are applied one at a time and the last one wins.
/// Holding the gate across the durable write and the store put keeps the
/// backend and the store agreeing on which submission was last.
pub struct CommitService {
    store: StateStore,
    backend: Arc<dyn ControlBackend>,
    gate: Mutex<()>,
}

impl CommitService {
    pub fn new(store: StateStore, backend: Arc<dyn ControlBackend>) -> Self {
        Self {
            store,
            backend,
            gate: Mutex::new(()),
        }
    }

    /// Loads the last durable configuration into the store. Returns the
    /// store revision when one was found.
    pub async fn restore(&self) -> Result<Option<u64>> {
        let _guard = self.gate.lock().await;
        match self.backend.load().await? {
            Some(config) => {
                let revision = self.store.put_controls(config)?;
                info!(
                    "Restored control configuration from {} backend",
                    self.backend.name()
                );
                Ok(Some(revision))
            }
            None => {
                info!(
                    "No saved control configuration in {} backend",
                    self.backend.name()
                );
                Ok(None)
            }
        }
    }

    pub async fn submit(&self, caller: &Caller, config: ControlConfig) -> Result<Committed> {
        let start = Instant::now();
        let mut submission = Submission::new(caller);

        submission.advance(CommitPhase::Validating);
        if let Err(e) = validate(&config) {
            submission.advance(CommitPhase::Rejected);
            COMMITS_REJECTED_TOTAL.inc();
            warn!("Rejected control submission from {}: {}", caller, e);
            return Err(e);
        }

        let _guard = self.gate.lock().await;
        submission.advance(CommitPhase::Committing);

        // A closed store cannot take the value, so do not persist it either
        if let Err(e) = self.store.ensure_open() {
            submission.advance(CommitPhase::Rejected);
            COMMIT_FAILURES_TOTAL.inc();
            warn!("Refusing controls from {}: {}", caller, e);
            return Err(e);
        }

        if let Err(e) = self.backend.save(&config).await {
            submission.advance(CommitPhase::Rejected);
            COMMIT_FAILURES_TOTAL.inc();
            error!(
                "Failed to persist controls from {} to {} backend: {}",
                caller,
                self.backend.name(),
                e
            );
            return Err(Error::TransportUnavailable(e.to_string()));
        }

        let revision = match self.store.put_controls(config.clone()) {
            Ok(revision) => revision,
            Err(e) => {
                submission.advance(CommitPhase::Rejected);
                COMMIT_FAILURES_TOTAL.inc();
                error!("Failed to publish controls from {}: {}", caller, e);
                return Err(e);
            }
        };

        submission.advance(CommitPhase::Committed);
        COMMITS_TOTAL.inc();
        COMMIT_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
        info!(
            "Committed controls revision {} from {} in {:.3}s",
            revision,
            caller,
            start.elapsed().as_secs_f64()
        );

        Ok(Committed { revision, config })
    }
}
