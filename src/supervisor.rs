//! Background maintenance tasks for a switchboard.
//!
//! Two independent periodic loops: health probing and usage-window
//! resets. Both are cancellable; shutdown cancels at the sleep points and
//! then awaits the tasks, so a probe already in flight finishes (or times
//! out) before the deployments are released.

use crate::deployment::DeploymentClient;
use futures_util::future::join_all;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Probes are splayed by up to this much so a fleet of clients with the
/// same interval does not hit every deployment at the same instant.
const PROBE_SPLAY: Duration = Duration::from_millis(250);

pub(crate) struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn the maintenance loops. A zero interval disables the
    /// corresponding loop.
    pub(crate) fn spawn(
        deployments: Vec<Arc<DeploymentClient>>,
        healthcheck_interval: Duration,
        ratelimit_window: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        if !healthcheck_interval.is_zero() {
            tasks.push(tokio::spawn(health_loop(
                deployments.clone(),
                healthcheck_interval,
                cancel.clone(),
            )));
        }

        if !ratelimit_window.is_zero() {
            tasks.push(tokio::spawn(reset_loop(
                deployments,
                ratelimit_window,
                cancel.clone(),
            )));
        }

        Self { cancel, tasks }
    }

    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn health_loop(
    deployments: Vec<Arc<DeploymentClient>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick fires immediately, giving every deployment an
    // initial probe right after start().
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let due: Vec<_> = deployments
                    .iter()
                    .filter(|d| d.due_for_probe())
                    .cloned()
                    .collect();
                if due.is_empty() {
                    continue;
                }
                debug!(count = due.len(), "probing deployments");
                join_all(due.iter().map(|deployment| async move {
                    let splay = PROBE_SPLAY.mul_f64(rand::rng().random_range(0.0..1.0));
                    tokio::time::sleep(splay).await;
                    deployment.probe().await;
                }))
                .await;
            }
        }
    }
}

async fn reset_loop(
    deployments: Vec<Arc<DeploymentClient>>,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Consume the immediate first tick; the first reset belongs at the
    // end of the first window.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!("rolling usage windows");
                for deployment in &deployments {
                    deployment.reset_usage();
                }
            }
        }
    }
}
