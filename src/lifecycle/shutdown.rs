//! Shutdown coordination.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::net::connection::ConnectionTracker;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that readiness tasks and the session runner
/// subscribe to.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> &broadcast::Sender<()> {
        &self.tx
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Stop accepting, wait for `tasks`, then give live sessions up to
    /// `drain_timeout`. Returns how many sessions were still running.
    pub async fn graceful(
        &self,
        tasks: Vec<JoinHandle<()>>,
        tracker: &ConnectionTracker,
        drain_timeout: Duration,
    ) -> u64 {
        self.trigger();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "task ended abnormally during shutdown");
            }
        }
        let left = tracker.drain(drain_timeout).await;
        if left > 0 {
            tracing::warn!(sessions = left, "drain timeout reached, closing remaining sessions");
        } else {
            tracing::info!("all sessions drained");
        }
        left
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn graceful_stops_subscribers() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        assert_eq!(shutdown.receiver_count(), 1);

        let tracker = ConnectionTracker::new();
        let left = shutdown
            .graceful(vec![task], &tracker, Duration::from_millis(10))
            .await;
        assert_eq!(left, 0);
        assert_eq!(shutdown.receiver_count(), 0);
    }

    #[tokio::test]
    async fn graceful_reports_stuck_sessions() {
        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();
        let _session = tracker.track();
        assert_eq!(
            shutdown.graceful(Vec::new(), &tracker, Duration::from_millis(10)).await,
            1
        );
    }
}
