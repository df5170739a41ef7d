//! Version-stamped deployment status with optimistic concurrency
//!
//! The in-memory snapshot is authoritative for the running engine and is
//! mirrored into the ArangoDeployment status subresource after every
//! accepted mutation. A mutation is accepted only when the caller's observed
//! version matches the current one; the version then increases by exactly 1.
//!
//! The snapshot lock is held only for the in-memory part of a write.
//! Persistence happens afterwards, serialized so that an older snapshot can
//! never overwrite a newer one in the external object.

use std::sync::Arc;

use arango_common::crd::DeploymentStatus;
use arango_common::retry::{retry_with_backoff, RetryConfig};
use arango_common::Error;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::KubeClient;

/// Durable sink for accepted status snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusPersister: Send + Sync {
    /// Write the snapshot to the external object
    async fn persist(&self, status: &DeploymentStatus) -> Result<(), Error>;
}

/// Persists into the ArangoDeployment status subresource
///
/// Transient API failures are retried a bounded number of times.
pub struct KubeStatusPersister {
    kube: Arc<dyn KubeClient>,
    namespace: String,
    name: String,
    retry: RetryConfig,
}

impl KubeStatusPersister {
    /// Create a persister for one deployment
    pub fn new(kube: Arc<dyn KubeClient>, namespace: &str, name: &str) -> Self {
        Self {
            kube,
            namespace: namespace.to_string(),
            name: name.to_string(),
            retry: RetryConfig::default(),
        }
    }
}

#[async_trait]
impl StatusPersister for KubeStatusPersister {
    async fn persist(&self, status: &DeploymentStatus) -> Result<(), Error> {
        retry_with_backoff(&self.retry, "persist deployment status", || {
            self.kube
                .patch_deployment_status(&self.namespace, &self.name, status)
        })
        .await
    }
}

struct Versioned {
    version: u64,
    status: DeploymentStatus,
}

/// The status of one deployment, owned by its engine
pub struct StatusStore {
    name: String,
    state: Mutex<Versioned>,
    persisted: tokio::sync::Mutex<u64>,
    persister: Arc<dyn StatusPersister>,
}

impl StatusStore {
    /// Create a store seeded with the last known status at version 0
    pub fn new(
        name: impl Into<String>,
        initial: DeploymentStatus,
        persister: Arc<dyn StatusPersister>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(Versioned {
                version: 0,
                status: initial,
            }),
            persisted: tokio::sync::Mutex::new(0),
            persister,
        }
    }

    /// Deep copy of the current status and its version
    pub fn read(&self) -> (DeploymentStatus, u64) {
        let state = self.state.lock();
        (state.status.clone(), state.version)
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Replace the status if `observed` is still current
    ///
    /// `force` skips the version check. On persistence failure the in-memory
    /// replacement stays in place and [`Error::Persist`] is returned.
    pub async fn write(
        &self,
        status: DeploymentStatus,
        observed: u64,
        force: bool,
    ) -> Result<u64, Error> {
        let (snapshot, version) = {
            let mut state = self.state.lock();
            if !force && observed != state.version {
                return Err(Error::conflict(observed, state.version));
            }
            state.version += 1;
            state.status = status;
            (state.status.clone(), state.version)
        };
        self.persist(snapshot, version).await?;
        Ok(version)
    }

    /// Apply `mutator` to the current status, writing only if it reports a change
    ///
    /// Read, mutate and version bump happen under one lock, so concurrent
    /// updaters never lose each other's changes.
    pub async fn with_update<F>(&self, mutator: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut DeploymentStatus) -> bool,
    {
        self.try_update(|status| Ok(mutator(status))).await
    }

    /// Like [`StatusStore::with_update`] for mutators that can fail
    ///
    /// A failing mutator leaves the status untouched.
    pub async fn try_update<F>(&self, mutator: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut DeploymentStatus) -> Result<bool, Error>,
    {
        let staged = {
            let mut state = self.state.lock();
            let mut status = state.status.clone();
            if !mutator(&mut status)? {
                None
            } else {
                state.version += 1;
                state.status = status;
                Some((state.status.clone(), state.version))
            }
        };
        match staged {
            Some((snapshot, version)) => {
                self.persist(snapshot, version).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-persist the current snapshot without changing it
    pub async fn resync(&self) -> Result<(), Error> {
        let (snapshot, version) = self.read();
        self.persist(snapshot, version).await
    }

    async fn persist(&self, snapshot: DeploymentStatus, version: u64) -> Result<(), Error> {
        let mut persisted = self.persisted.lock().await;
        if version < *persisted {
            debug!(
                deployment = %self.name,
                version,
                persisted = *persisted,
                "newer status already persisted, skipping"
            );
            return Ok(());
        }
        if let Err(e) = self.persister.persist(&snapshot).await {
            warn!(deployment = %self.name, version, error = %e, "failed to persist status");
            return Err(Error::persist(&self.name, e.to_string()));
        }
        *persisted = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arango_common::crd::{ConditionType, DeploymentPhase};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Persister that records every snapshot it is handed
    #[derive(Default)]
    struct RecordingPersister {
        written: Mutex<Vec<DeploymentStatus>>,
    }

    #[async_trait]
    impl StatusPersister for RecordingPersister {
        async fn persist(&self, status: &DeploymentStatus) -> Result<(), Error> {
            self.written.lock().push(status.clone());
            Ok(())
        }
    }

    fn store() -> (Arc<StatusStore>, Arc<RecordingPersister>) {
        let persister = Arc::new(RecordingPersister::default());
        let store = Arc::new(StatusStore::new(
            "cluster",
            DeploymentStatus::default(),
            persister.clone(),
        ));
        (store, persister)
    }

    fn running() -> DeploymentStatus {
        DeploymentStatus {
            phase: DeploymentPhase::Running,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn write_with_current_version_is_accepted_and_persisted() {
        let (store, persister) = store();
        let (_, v) = store.read();
        assert_eq!(store.write(running(), v, false).await.unwrap(), 1);
        assert_eq!(store.read().0.phase, DeploymentPhase::Running);
        assert_eq!(persister.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn stale_write_is_a_conflict() {
        let (store, persister) = store();
        store.write(running(), 0, false).await.unwrap();

        let err = store
            .write(DeploymentStatus::default(), 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { observed: 0, current: 1 }));
        assert_eq!(store.read().0.phase, DeploymentPhase::Running);
        assert_eq!(persister.written.lock().len(), 1);
    }

    #[tokio::test]
    async fn forced_write_skips_version_check() {
        let (store, _) = store();
        store.write(running(), 0, false).await.unwrap();
        assert_eq!(
            store.write(DeploymentStatus::default(), 0, true).await.unwrap(),
            2
        );
    }

    /// Two writers observe version 3; exactly one wins and the version moves by one.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_with_same_version_admit_one() {
        let (store, _) = store();
        for _ in 0..3 {
            let v = store.version();
            store.write(running(), v, false).await.unwrap();
        }
        assert_eq!(store.version(), 3);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let mut status = running();
                    status.applied_version = format!("writer-{i}");
                    store.write(status, 3, false).await
                })
            })
            .collect();

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(v) => {
                    assert_eq!(v, 4);
                    ok += 1;
                }
                Err(e) => {
                    assert!(e.is_conflict());
                    conflicts += 1;
                }
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(store.version(), 4);
    }

    #[tokio::test]
    async fn with_update_writes_only_on_change() {
        let (store, persister) = store();

        let changed = store
            .with_update(|s| {
                s.conditions
                    .update(ConditionType::UpToDate, false, "Spec changed", "")
            })
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(store.version(), 1);

        let changed = store
            .with_update(|s| {
                s.conditions
                    .update(ConditionType::UpToDate, false, "Spec changed", "")
            })
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(store.version(), 1);
        assert_eq!(persister.written.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_do_not_lose_changes() {
        let (store, _) = store();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .with_update(|s| {
                            s.secret_hashes.insert(format!("s{i}"), "h".to_string());
                            true
                        })
                        .await
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(store.version(), 16);
        assert_eq!(store.read().0.secret_hashes.len(), 16);
    }

    #[tokio::test]
    async fn failing_mutator_leaves_status_untouched() {
        let (store, _) = store();
        let result = store
            .try_update(|s| {
                s.phase = DeploymentPhase::Failed;
                Err(Error::internal("mutation aborted"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.read(), (DeploymentStatus::default(), 0));
    }

    #[tokio::test]
    async fn persist_failure_keeps_in_memory_mutation() {
        let mut persister = MockStatusPersister::new();
        persister
            .expect_persist()
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        let store = StatusStore::new("cluster", DeploymentStatus::default(), Arc::new(persister));

        let err = store.write(running(), 0, false).await.unwrap_err();
        assert!(matches!(err, Error::Persist { .. }));
        assert_eq!(store.read().0.phase, DeploymentPhase::Running);
        assert_eq!(store.version(), 1);
    }

    #[tokio::test]
    async fn resync_persists_current_snapshot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let mut persister = MockStatusPersister::new();
        persister.expect_persist().returning(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let store = StatusStore::new("cluster", running(), Arc::new(persister));
        store.resync().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.version(), 0);
    }

    #[tokio::test]
    async fn kube_persister_gives_up_after_bounded_retries() {
        let mut kube = crate::client::MockKubeClient::new();
        kube.expect_patch_deployment_status()
            .times(2)
            .returning(|_, _, _| Err(Error::internal("connection reset")));
        let mut persister = KubeStatusPersister::new(Arc::new(kube), "db", "cluster");
        persister.retry = RetryConfig {
            max_attempts: 2,
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
            backoff_multiplier: 2.0,
        };
        let err = persister.persist(&running()).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    }
}
