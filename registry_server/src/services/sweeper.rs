//! Periodic background reconciliation of every known repository.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::Registry;
use crate::services::reconciler::sweep;

pub struct Sweeper {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop. The first sweep runs one `interval` after start.
    pub fn start(registry: Registry, interval: Duration, per_repository_timeout: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&registry, per_repository_timeout).await;
                    }
                    _ = stopped.changed() => break,
                }
            }
            tracing::debug!("Sweeper stopped");
        });
        tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");
        Self { stop, task }
    }

    /// Signal the loop and wait for an in-flight sweep to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Sweeper task ended abnormally");
        }
    }
}
