//! Shutdown coordination for the pipeline.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Background loops (rate-limit sweeper, task dispatcher, retention cleanup,
/// config watcher) subscribe and exit when the signal fires.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of loops still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Trigger, then wait up to `deadline` for `handles` to finish. Loops
    /// still running afterwards are aborted.
    pub async fn drain(&self, handles: Vec<JoinHandle<()>>, deadline: Duration) {
        self.trigger();

        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(deadline, futures_util::future::join_all(handles)).await;

        if joined.is_err() {
            tracing::warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Background loops did not stop in time, aborting"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
