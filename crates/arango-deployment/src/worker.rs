//! Long-lived worker driving one deployment engine
//!
//! Cycles of one deployment never overlap: the worker runs a cycle to
//! completion, then sleeps for the interval it returned. An update
//! notification cuts the sleep short and resets the interval to the floor;
//! a quiet timer fire grows it.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deployment::Deployment;

/// Control handle of a running worker
pub struct DeploymentHandle {
    update: Arc<Notify>,
    stop: CancellationToken,
    join: JoinHandle<()>,
}

impl DeploymentHandle {
    /// Ask for a cycle as soon as the current one is done
    pub fn notify_update(&self) {
        self.update.notify_one();
    }

    /// Stop the worker; it releases child finalizers before exiting
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether the worker task has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker task to exit
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(error = %e, "deployment worker task failed");
        }
    }
}

/// Start the worker of `deployment`
///
/// `shutdown` ends the worker without teardown; stopping the handle or the
/// owning object disappearing ends it with teardown.
pub fn spawn(deployment: Deployment, shutdown: CancellationToken) -> DeploymentHandle {
    let update = Arc::new(Notify::new());
    let stop = deployment.stop_token();
    let join = tokio::spawn(run(deployment, update.clone(), shutdown));
    DeploymentHandle { update, stop, join }
}

async fn run(mut deployment: Deployment, update: Arc<Notify>, shutdown: CancellationToken) {
    let stop = deployment.stop_token();
    info!(namespace = %deployment.namespace(), deployment = %deployment.name(), "starting deployment worker");

    if let Err(e) = deployment.start().await {
        warn!(deployment = %deployment.name(), error = %e, "Unable to move deployment to Running");
    }

    let mut interval = deployment.floor();
    loop {
        if shutdown.is_cancelled() {
            debug!(deployment = %deployment.name(), "operator shutting down");
            return;
        }
        if stop.is_cancelled() {
            break;
        }

        interval = deployment.inspect_deployment(interval).await;

        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = stop.cancelled() => {}
            _ = update.notified() => {
                interval = deployment.floor();
            }
            _ = tokio::time::sleep(interval.as_duration()) => {
                interval = deployment.relax(interval);
            }
        }
    }

    if let Err(e) = deployment.teardown().await {
        warn!(deployment = %deployment.name(), error = %e, "Unable to release child finalizers");
    }
    info!(deployment = %deployment.name(), "deployment worker stopped");
}
