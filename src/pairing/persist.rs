//! Bounded credential persistence queue.
//!
//! Credential updates from the messaging client are queued to a per-session
//! writer task instead of being written fire-and-forget. The queue is
//! bounded, consecutive updates collapse to the newest blob, failed writes are
//! retried, and the outcome is visible through counters and [`flush`].
//!
//! [`flush`]: CredsPersister::flush

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::transport::CredsSaver;

/// Write attempts per blob before giving up on it.
const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Pause between write attempts.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

enum PersistCommand {
    Save(Value),
    Flush(oneshot::Sender<()>),
}

/// Counters for one session's persistence queue.
#[derive(Debug, Default)]
pub struct PersistStats {
    /// Blobs written successfully.
    pub saved: AtomicU64,
    /// Blobs dropped after every write attempt failed.
    pub failed: AtomicU64,
    /// Updates superseded by a newer blob before being written.
    pub coalesced: AtomicU64,
}

/// Handle to a session's credential writer task.
#[derive(Clone)]
pub struct CredsPersister {
    tx: mpsc::Sender<PersistCommand>,
    stats: Arc<PersistStats>,
}

impl CredsPersister {
    /// Spawn a writer task for `saver` with a queue of `capacity` commands.
    ///
    /// The task ends once every handle has been dropped and the queue drained.
    pub fn spawn(saver: CredsSaver, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(PersistStats::default());
        tokio::spawn(run_writer(saver, rx, Arc::clone(&stats)));
        Self { tx, stats }
    }

    /// Queue a credential blob. Waits for room when the queue is full.
    ///
    /// Returns `false` if the writer task is gone.
    pub async fn enqueue(&self, creds: Value) -> bool {
        self.tx.send(PersistCommand::Save(creds)).await.is_ok()
    }

    /// Wait until every blob queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn saved(&self) -> u64 {
        self.stats.saved.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.stats.coalesced.load(Ordering::Relaxed)
    }
}

async fn run_writer(
    saver: CredsSaver,
    mut rx: mpsc::Receiver<PersistCommand>,
    stats: Arc<PersistStats>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Save(mut latest) => {
                // Collapse a burst of updates into the newest blob, but stop at
                // a flush so it observes everything queued before it.
                let mut pending_flush = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        PersistCommand::Save(newer) => {
                            stats.coalesced.fetch_add(1, Ordering::Relaxed);
                            latest = newer;
                        }
                        PersistCommand::Flush(done) => {
                            pending_flush = Some(done);
                            break;
                        }
                    }
                }

                write_with_retry(&saver, &latest, &stats).await;

                if let Some(done) = pending_flush {
                    let _ = done.send(());
                }
            }
            PersistCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn write_with_retry(saver: &CredsSaver, creds: &Value, stats: &PersistStats) {
    for attempt in 1..=MAX_WRITE_ATTEMPTS {
        match saver.save(creds).await {
            Ok(()) => {
                stats.saved.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) if attempt < MAX_WRITE_ATTEMPTS => {
                tracing::debug!(path = %saver.path().display(), attempt, error = %e, "Credential write failed, retrying");
                tokio::time::sleep(WRITE_RETRY_DELAY).await;
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(path = %saver.path().display(), attempts = attempt, error = %e, "Dropping credential update after repeated write failures");
            }
        }
    }
}
