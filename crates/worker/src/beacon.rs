//! Monotonic status-version beacon for long-poll wake-ups.
//!
//! Contract:
//! - `bump` increments the version and wakes current waiters in one critical
//!   section, so a waiter that registered while holding version V cannot miss
//!   the change that produces V+1;
//! - versions saturate instead of wrapping.

use tokio::sync::watch;

/// First version published for a freshly created task.
pub const STARTING_VERSION: u64 = 1;

/// Monotonic version counter fanned out to long-poll waiters.
#[derive(Debug)]
pub struct VersionBeacon {
    tx: watch::Sender<u64>,
}

impl VersionBeacon {
    /// Create a beacon at [`STARTING_VERSION`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(STARTING_VERSION);
        Self { tx }
    }

    #[cfg(test)]
    pub(crate) fn with_version(version: u64) -> Self {
        let (tx, _rx) = watch::channel(version);
        Self { tx }
    }

    /// Currently published version.
    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Publish the next version and wake every registered waiter.
    pub fn bump(&self) {
        self.tx.send_modify(|version| *version = version.saturating_add(1));
        quarry_common::global_metrics().inc_status_notification();
    }

    /// Receiver for the published version stream.
    ///
    /// Callers must `borrow_and_update` before awaiting `changed` so a bump
    /// between subscription and the version check is never lost.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    /// Wait until the published version exceeds `callers_version`.
    pub async fn wait_newer(&self, callers_version: u64) {
        let mut rx = self.subscribe();
        loop {
            let published = *rx.borrow_and_update();
            if published > callers_version {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for VersionBeacon {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn bump_increments_published_version() {
        let beacon = VersionBeacon::new();
        assert_eq!(beacon.current(), STARTING_VERSION);
        beacon.bump();
        beacon.bump();
        assert_eq!(beacon.current(), STARTING_VERSION + 2);
    }

    #[tokio::test]
    async fn waiter_is_released_by_next_bump() {
        let beacon = Arc::new(VersionBeacon::new());
        let observed = beacon.current();

        let waiter = {
            let beacon = Arc::clone(&beacon);
            tokio::spawn(async move { beacon.wait_newer(observed).await })
        };
        beacon.bump();
        timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter released")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn stale_version_returns_without_waiting() {
        let beacon = VersionBeacon::new();
        beacon.bump();
        timeout(Duration::from_secs(5), beacon.wait_newer(STARTING_VERSION))
            .await
            .expect("no wait needed");
    }

    #[tokio::test]
    async fn version_saturates_at_max() {
        let beacon = VersionBeacon::with_version(u64::MAX);
        beacon.bump();
        assert_eq!(beacon.current(), u64::MAX);
    }
}
