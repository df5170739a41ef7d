//! Process-wide registry of deployment workers

use std::collections::BTreeMap;

use arango_common::metrics::DEPLOYMENTS_MANAGED;
use arango_deployment::DeploymentHandle;
use parking_lot::Mutex;
use tracing::debug;

/// Control surface the registry needs from a worker
pub trait Worker: Send {
    /// Ask for a prompt cycle
    fn notify_update(&self);
    /// Stop the worker with teardown
    fn stop(&self);
    /// Whether the worker has exited
    fn is_finished(&self) -> bool;
}

impl Worker for DeploymentHandle {
    fn notify_update(&self) {
        DeploymentHandle::notify_update(self)
    }

    fn stop(&self) {
        DeploymentHandle::stop(self)
    }

    fn is_finished(&self) -> bool {
        DeploymentHandle::is_finished(self)
    }
}

/// Registry key of a deployment
pub fn key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// One worker per `namespace/name`
pub struct DeploymentRegistry<W: Worker = DeploymentHandle> {
    workers: Mutex<BTreeMap<String, W>>,
}

impl<W: Worker> Default for DeploymentRegistry<W> {
    fn default() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<W: Worker> DeploymentRegistry<W> {
    /// Register a worker; a previous worker under the same key is stopped
    pub fn add(&self, key: String, worker: W) {
        let mut workers = self.workers.lock();
        if let Some(old) = workers.insert(key.clone(), worker) {
            debug!(deployment = %key, "replacing deployment worker");
            old.stop();
        }
        DEPLOYMENTS_MANAGED.record(workers.len() as i64, &[]);
    }

    /// Notify the live worker under `key`
    ///
    /// Returns false if there is none. An exited worker is dropped so a new
    /// one can be started.
    pub fn notify(&self, key: &str) -> bool {
        let mut workers = self.workers.lock();
        match workers.get(key) {
            Some(worker) if !worker.is_finished() => {
                worker.notify_update();
                true
            }
            Some(_) => {
                workers.remove(key);
                DEPLOYMENTS_MANAGED.record(workers.len() as i64, &[]);
                false
            }
            None => false,
        }
    }

    /// Unregister and stop the worker under `key`
    pub fn remove(&self, key: &str) -> Option<W> {
        let mut workers = self.workers.lock();
        let worker = workers.remove(key)?;
        worker.stop();
        DEPLOYMENTS_MANAGED.record(workers.len() as i64, &[]);
        Some(worker)
    }

    /// Keys of all registered workers, in order
    pub fn keys(&self) -> Vec<String> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    /// Take every worker out of the registry
    pub fn drain(&self) -> Vec<W> {
        let workers = std::mem::take(&mut *self.workers.lock());
        DEPLOYMENTS_MANAGED.record(0, &[]);
        workers.into_values().collect()
    }
}
