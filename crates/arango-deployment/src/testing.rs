//! Shared fixtures and fakes for engine tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arango_common::crd::{
    ArangoDeployment, ConditionType, DeploymentMode, DeploymentPhase, DeploymentSpec,
    DeploymentStatus, ImageInfo,
};
use arango_common::events::EventPublisher;
use arango_common::timeouts::Timeouts;
use arango_common::{Error, FINALIZER_REMOVE_CHILD_FINALIZERS};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use parking_lot::Mutex;

use crate::agency::{AgencyClient, AgencySnapshot};
use crate::client::MockKubeClient;
use crate::deployment::Collaborators;
use crate::images::MockVersionClient;
use crate::inspector::{ClusterCache, Inspector};
use crate::interval::{Interval, DEFAULT_MAX_INTERVAL, DEFAULT_MIN_INTERVAL};
use crate::pipeline::CycleContext;
use crate::plan::PlanEngine;
use crate::resources::ResourceEnsurer;
use crate::status_store::{StatusPersister, StatusStore};

pub const IMAGE: &str = "arangodb/arangodb:3.12.1";

/// Three-group cluster "db/cluster" carrying the child finalizer token
pub fn cluster_deployment() -> ArangoDeployment {
    let mut obj = ArangoDeployment::new(
        "cluster",
        DeploymentSpec {
            mode: DeploymentMode::Cluster,
            image: IMAGE.to_string(),
            ..Default::default()
        },
    );
    obj.metadata = ObjectMeta {
        name: Some("cluster".to_string()),
        namespace: Some("db".to_string()),
        uid: Some("uid-cluster".to_string()),
        resource_version: Some("42".to_string()),
        finalizers: Some(vec![FINALIZER_REMOVE_CHILD_FINALIZERS.to_string()]),
        ..Default::default()
    };
    obj
}

pub fn resolved_image(image: &str, image_id: &str) -> ImageInfo {
    ImageInfo {
        image: image.to_string(),
        image_id: image_id.to_string(),
        arangodb_version: "3.12.1".to_string(),
        enterprise: false,
    }
}

/// Status of a deployment with nothing left to do
pub fn steady_status(obj: &ArangoDeployment) -> DeploymentStatus {
    let mut status = DeploymentStatus {
        phase: DeploymentPhase::Running,
        applied_version: obj.spec.checksum().unwrap(),
        ..Default::default()
    };
    status.images.add(resolved_image(&obj.spec.image, "sha256:steady"));
    status.current_image = status.images.get(&obj.spec.image).cloned();
    status.conditions.update(
        ConditionType::UpToDate,
        true,
        "Spec is Up To Date",
        "Spec is Up To Date",
    );
    status
}

/// Persister that records every snapshot it is handed
#[derive(Default)]
pub struct RecordingPersister {
    written: Mutex<Vec<DeploymentStatus>>,
}

impl RecordingPersister {
    pub fn count(&self) -> usize {
        self.written.lock().len()
    }

    pub fn last(&self) -> Option<DeploymentStatus> {
        self.written.lock().last().cloned()
    }
}

#[async_trait]
impl StatusPersister for RecordingPersister {
    async fn persist(&self, status: &DeploymentStatus) -> Result<(), Error> {
        self.written.lock().push(status.clone());
        Ok(())
    }
}

pub fn recording_store() -> (Arc<StatusStore>, Arc<RecordingPersister>) {
    let persister = Arc::new(RecordingPersister::default());
    let store = Arc::new(StatusStore::new(
        "cluster",
        DeploymentStatus::default(),
        persister.clone(),
    ));
    (store, persister)
}

pub fn cycle_context<'a>(
    owner: &'a ArangoDeployment,
    cache: &'a Inspector,
    status: &'a StatusStore,
) -> CycleContext<'a> {
    CycleContext {
        namespace: "db",
        name: "cluster",
        deployment: owner,
        cache,
        status,
        timeouts: Timeouts::default(),
        min_interval: Interval::new(DEFAULT_MIN_INTERVAL),
        next_interval: Interval::new(DEFAULT_MAX_INTERVAL),
        agency: None,
    }
}

/// Cache handing out a settable snapshot
#[derive(Default)]
pub struct FakeCache {
    current: Mutex<Arc<Inspector>>,
    refreshes: AtomicUsize,
}

impl FakeCache {
    pub fn set(&self, inspector: Inspector) {
        *self.current.lock() = Arc::new(inspector);
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterCache for FakeCache {
    async fn refresh(&self, _namespace: &str, _name: &str) -> Result<Arc<Inspector>, Error> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.current.lock().clone())
    }
}

/// Plan engine recording its calls
#[derive(Default)]
pub struct FakePlan {
    calls: Mutex<Vec<&'static str>>,
    create_result: AtomicBool,
    execute_result: AtomicBool,
}

impl FakePlan {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn set_create_result(&self, changed: bool) {
        self.create_result.store(changed, Ordering::SeqCst);
    }

    pub fn set_execute_result(&self, more: bool) {
        self.execute_result.store(more, Ordering::SeqCst);
    }
}

#[async_trait]
impl PlanEngine for FakePlan {
    async fn check_deployment(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.calls.lock().push("check");
        Ok(())
    }

    async fn create_plan(&self, _cx: &CycleContext<'_>) -> Result<bool, Error> {
        self.calls.lock().push("create");
        Ok(self.create_result.load(Ordering::SeqCst))
    }

    async fn execute_plan(&self, _cx: &CycleContext<'_>) -> Result<bool, Error> {
        self.calls.lock().push("execute");
        Ok(self.execute_result.load(Ordering::SeqCst))
    }
}

/// Resource ensurer that succeeds without side effects unless told otherwise
#[derive(Default)]
pub struct FakeResources {
    calls: Mutex<Vec<&'static str>>,
    fail_secret_hashes: AtomicBool,
    reconcile_license: AtomicBool,
    hang: AtomicBool,
}

impl FakeResources {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn fail_secret_hashes(&self) {
        self.fail_secret_hashes.store(true, Ordering::SeqCst);
    }

    pub fn need_reconcile_on_license(&self) {
        self.reconcile_license.store(true, Ordering::SeqCst);
    }

    /// Make pod inspection never return
    pub fn hang_on_inspect(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl ResourceEnsurer for FakeResources {
    async fn cleanup_terminated_pods(
        &self,
        _cx: &CycleContext<'_>,
    ) -> Result<Option<Interval>, Error> {
        self.record("cleanup");
        Ok(None)
    }

    async fn ensure_core_resources(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.record("core");
        Ok(())
    }

    async fn validate_secret_hashes(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.record("secret-hashes");
        if self.fail_secret_hashes.load(Ordering::SeqCst) {
            return Err(Error::internal_with_context("secrets", "jwt secret unreadable"));
        }
        Ok(())
    }

    async fn validate_license(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.record("license");
        if self.reconcile_license.load(Ordering::SeqCst) {
            return Err(Error::reconcile("license secret not yet created"));
        }
        Ok(())
    }

    async fn inspect_pods(&self, _cx: &CycleContext<'_>) -> Result<Option<Interval>, Error> {
        self.record("pods");
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(None)
    }

    async fn inspect_pvcs(&self, _cx: &CycleContext<'_>) -> Result<Option<Interval>, Error> {
        self.record("pvcs");
        Ok(None)
    }

    async fn ensure_resources(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.record("resources");
        Ok(())
    }

    async fn create_access_packages(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.record("access-packages");
        Ok(())
    }

    async fn sync_members(&self, _cx: &CycleContext<'_>) -> Result<(), Error> {
        self.record("members");
        Ok(())
    }
}

/// Agency returning an empty snapshot, or failing
#[derive(Default)]
pub struct FakeAgency {
    failing: AtomicBool,
    maintenance: Mutex<Vec<bool>>,
}

impl FakeAgency {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn maintenance_calls(&self) -> Vec<bool> {
        self.maintenance.lock().clone()
    }
}

#[async_trait]
impl AgencyClient for FakeAgency {
    async fn refresh(&self, _namespace: &str, _name: &str) -> Result<AgencySnapshot, Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::http("cluster-agent", "connection refused"));
        }
        Ok(AgencySnapshot::default())
    }

    async fn set_maintenance(
        &self,
        _namespace: &str,
        _name: &str,
        enabled: bool,
    ) -> Result<(), Error> {
        self.maintenance.lock().push(enabled);
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub reason: String,
    pub note: String,
    pub warning: bool,
}

#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            reason: reason.to_string(),
            note: note.unwrap_or_default(),
            warning: matches!(type_, EventType::Warning),
        });
    }
}

/// Collaborators under test control
pub struct Fakes {
    pub kube: MockKubeClient,
    pub versions: MockVersionClient,
    pub cache: Arc<FakeCache>,
    pub plan: Arc<FakePlan>,
    pub resources: Arc<FakeResources>,
    pub agency: Arc<FakeAgency>,
    pub events: Arc<RecordingEvents>,
}

impl Fakes {
    pub fn collaborators(self) -> Collaborators {
        Collaborators {
            kube: Arc::new(self.kube),
            cache: self.cache,
            plan: self.plan,
            resources: self.resources,
            agency: self.agency,
            versions: Arc::new(self.versions),
            events: self.events,
        }
    }
}

pub fn fakes() -> Fakes {
    Fakes {
        kube: MockKubeClient::new(),
        versions: MockVersionClient::new(),
        cache: Arc::default(),
        plan: Arc::default(),
        resources: Arc::default(),
        agency: Arc::default(),
        events: Arc::default(),
    }
}
