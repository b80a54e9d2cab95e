use crate::errors::Result;
use crate::metrics::set_stream_live;
use crate::model::{Slot, StreamState};
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically marks the camera stream offline once no frame has arrived
/// for `stale_after`.
pub async fn run_liveness_monitor(store: StateStore, stale_after: Duration, check_interval: Duration) {
    info!(
        "Starting stream liveness monitor with stale_after={:?}, check_interval={:?}",
        stale_after, check_interval
    );

    let stale_after = match chrono::Duration::from_std(stale_after) {
        Ok(d) => d,
        Err(e) => {
            error!("Invalid stream staleness threshold: {}", e);
            return;
        }
    };
    let check_interval = if check_interval.is_zero() {
        warn!("Liveness check interval is zero, using {:?}", MIN_CHECK_INTERVAL);
        MIN_CHECK_INTERVAL
    } else {
        check_interval
    };
    let mut ticker = interval(check_interval);

    loop {
        ticker.tick().await;
        if let Err(e) = sweep(&store, Utc::now(), stale_after) {
            // The store only refuses writes once it is shut down
            info!("Stopping liveness monitor: {}", e);
            break;
        }
    }
}

/// Flips a stale live stream to offline. Returns true when it did.
///
/// The write is conditional on the revision that was inspected, so a frame
/// that lands between the read and the write is never overwritten.
pub fn sweep(store: &StateStore, now: DateTime<Utc>, stale_after: chrono::Duration) -> Result<bool> {
    let current = match store.stream().get() {
        Slot::Ready(current) => current,
        Slot::Uninitialized => return Ok(false),
    };

    let last_frame = match (&current.value.frame, current.value.live) {
        (Some(frame), true) => frame.captured_at,
        _ => return Ok(false),
    };

    let age = now - last_frame;
    if age <= stale_after {
        return Ok(false);
    }

    match store.put_stream_if_revision(current.revision, StreamState::offline())? {
        Some(revision) => {
            set_stream_live(false);
            info!(
                "Camera stream offline: last frame {}s ago (revision {})",
                age.num_seconds(),
                revision
            );
            Ok(true)
        }
        None => {
            debug!("Stream changed during liveness sweep, skipping");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topic;

    #[test]
    fn test_uninitialized_stream_is_left_alone() {
        let store = StateStore::new();
        assert!(!sweep(&store, Utc::now(), chrono::Duration::seconds(30)).unwrap());
        assert_eq!(store.stream().get(), Slot::Uninitialized);
    }

    #[test]
    fn test_fresh_frame_stays_live() {
        let store = StateStore::new();
        let now = Utc::now();
        store
            .put_stream(StreamState::from_payload(b"frame", now - chrono::Duration::seconds(5)))
            .unwrap();

        assert!(!sweep(&store, now, chrono::Duration::seconds(30)).unwrap());
        assert!(store.stream().get().ready(Topic::Stream).unwrap().value.live);
    }

    #[test]
    fn test_stale_frame_goes_offline_once() {
        let store = StateStore::new();
        let now = Utc::now();
        store
            .put_stream(StreamState::from_payload(b"frame", now - chrono::Duration::seconds(45)))
            .unwrap();

        assert!(sweep(&store, now, chrono::Duration::seconds(30)).unwrap());
        let state = store.stream().get().ready(Topic::Stream).unwrap();
        assert_eq!(state.revision, 2);
        assert!(!state.value.live);
        assert!(state.value.frame.is_none());

        // Already offline, no further writes
        assert!(!sweep(&store, now, chrono::Duration::seconds(30)).unwrap());
        assert_eq!(store.stream().get().revision(), 2);
    }

    #[test]
    fn test_closed_store_stops_sweep() {
        let store = StateStore::new();
        let now = Utc::now();
        store
            .put_stream(StreamState::from_payload(b"frame", now - chrono::Duration::seconds(45)))
            .unwrap();
        store.close();

        assert!(sweep(&store, now, chrono::Duration::seconds(30)).is_err());
    }

    #[tokio::test]
    async fn test_zero_check_interval_does_not_panic() {
        let store = StateStore::new();
        store
            .put_stream(StreamState::from_payload(
                b"frame",
                Utc::now() - chrono::Duration::seconds(45),
            ))
            .unwrap();
        store.close();

        // The closed store ends the monitor on its first sweep
        let handle = tokio::spawn(run_liveness_monitor(
            store,
            Duration::from_secs(30),
            Duration::ZERO,
        ));
        let joined = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor did not stop");
        assert!(joined.is_ok());
    }
}
