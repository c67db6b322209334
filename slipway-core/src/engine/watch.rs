use tokio::sync::watch as signal;
use tracing::{error, info, warn};

use super::Orchestrator;
use crate::store::StateStore;

impl<S: StateStore> Orchestrator<S> {
    /// Leader loop.
    ///
    /// Claims leadership, and while leader starts every pending top-level
    /// task and heartbeats once per poll. Loss of leadership returns the loop
    /// to claiming. Errors are logged, never propagated. Leadership is
    /// released when `shutdown` flips to `true` or its sender is dropped.
    pub async fn watch_for_tasks(&self, mut shutdown: signal::Receiver<bool>) {
        let identity = self.leader.identity();
        info!(%identity, "task watcher started");
        let mut leading = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            leading = if leading {
                match self.leader.maintain().await {
                    Ok(held) => held,
                    Err(e) => {
                        warn!(%identity, error = %e, "leadership heartbeat failed");
                        false
                    }
                }
            } else {
                match self.leader.claim().await {
                    Ok(true) => {
                        info!(%identity, "assumed leadership");
                        true
                    }
                    Ok(false) => false,
                    Err(e) => {
                        error!(%identity, error = %e, "leadership claim failed");
                        false
                    }
                }
            };

            let wait = if leading {
                self.start_pending_tasks().await;
                self.config.poll_interval
            } else {
                self.config.leadership_claim_interval
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if leading {
            if let Err(e) = self.leader.abdicate().await {
                warn!(%identity, error = %e, "failed to release leadership");
            }
        }
        info!(%identity, "task watcher stopped");
    }

    async fn start_pending_tasks(&self) {
        loop {
            let next = match self.store.next_pending_task().await {
                Ok(Some(task)) => task,
                Ok(None) => return,
                Err(e) => {
                    error!(error = %e, "failed to poll task queue");
                    return;
                }
            };
            if let Err(e) = self.execute_task(next.task_id).await {
                // The task stays queued; stop so it is not hammered every loop.
                error!(task_id = %next.task_id, error = %e, "failed to start task");
                return;
            }
        }
    }
}
