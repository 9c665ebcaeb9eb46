//! Lock heartbeat task
//!
//! Renews `heartbeat_at` on a batch row while the executor works on it.
//! If a renewal finds the row no longer owned, the task records the loss
//! and exits; the executor's conditional finish then reports it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::BatchStore;

pub struct Heartbeat {
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Heartbeat {
    /// Spawn a renewal loop for `batch_id`. The first renewal happens one
    /// `interval` after spawn; lock acquisition already stamped the row.
    pub fn spawn<S>(store: Arc<S>, batch_id: i64, owner: String, interval: Duration) -> Self
    where
        S: BatchStore + ?Sized + 'static,
    {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let task = {
            let cancel = cancel.clone();
            let lost = Arc::clone(&lost);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match store.heartbeat(batch_id, &owner).await {
                        Ok(true) => debug!(batch_id, "[Heartbeat] renewed"),
                        Ok(false) => {
                            warn!(batch_id, owner = %owner, "[Heartbeat] lock no longer held");
                            lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        // Transient; the next tick tries again before the lock goes stale
                        Err(e) => warn!(batch_id, error = %e, "[Heartbeat] renewal failed"),
                    }
                }
            })
        };

        Self { cancel, lost, task }
    }

    /// Whether a renewal found the lock taken over.
    pub fn lock_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing and wait for the task to exit. Returns `lock_lost()`.
    pub async fn stop(self) -> bool {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "[Heartbeat] task ended abnormally");
        }
        self.lost.load(Ordering::SeqCst)
    }
}
