//! Reconciliation engine for a single ArangoDeployment
//!
//! [`Deployment::inspect_deployment`] runs one bounded cycle: refresh the
//! snapshot, decide whether the cycle runs at all, then hand over to the
//! ordered pipeline steps. The outcome is turned into the delay before the
//! next cycle by the scheduler.

use std::sync::Arc;
use std::time::Instant;

use arango_common::crd::{ArangoDeployment, ConditionType, DeploymentPhase, ServerGroup};
use arango_common::events::{actions, reasons, EventPublisher};
use arango_common::metrics::{
    deployment_labels, DEPLOYMENT_CONDITION, DEPLOYMENT_MEMBERS, INSPECT_DEPLOYMENT_CYCLES,
    INSPECT_DEPLOYMENT_DURATION, STATUS_RESTORES,
};
use arango_common::timeouts::Timeouts;
use arango_common::{Error, ANNOTATION_MAINTENANCE};
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::agency::{AgencyClient, HttpAgencyClient};
use crate::client::KubeClient;
use crate::finalizers::{
    add_finalizers, remove_pod_finalizers, remove_pvc_finalizers, run_deployment_finalizers,
};
use crate::images::{HttpVersionClient, VersionClient};
use crate::inspector::{ClusterCache, KubeClusterCache};
use crate::interval::{
    CycleOutcome, InspectionScheduler, Interval, DEFAULT_MAX_INTERVAL, DEFAULT_MIN_INTERVAL,
};
use crate::pipeline::{default_steps, run_steps, CycleContext, Flow, Step};
use crate::plan::{PlanEngine, ScalePlanEngine};
use crate::resources::{KubeResources, ResourceEnsurer};
use crate::status_store::{KubeStatusPersister, StatusPersister, StatusStore};

/// Collaborators shared by the engines of all deployments
pub struct Collaborators {
    /// Platform object API
    pub kube: Arc<dyn KubeClient>,
    /// Source of per-cycle snapshots
    pub cache: Arc<dyn ClusterCache>,
    /// Corrective plan engine
    pub plan: Arc<dyn PlanEngine>,
    /// Resource ensurer
    pub resources: Arc<dyn ResourceEnsurer>,
    /// Agency access
    pub agency: Arc<dyn AgencyClient>,
    /// Version queries against probe pods
    pub versions: Arc<dyn VersionClient>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl Collaborators {
    /// Production wiring on top of a platform client
    pub fn kubernetes(
        kube: Arc<dyn KubeClient>,
        events: Arc<dyn EventPublisher>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            cache: Arc::new(KubeClusterCache::new(kube.clone())),
            plan: Arc::new(ScalePlanEngine::new(kube.clone())),
            resources: Arc::new(KubeResources::new(kube.clone())),
            agency: Arc::new(HttpAgencyClient::new(timeouts.arangod)),
            versions: Arc::new(HttpVersionClient::new(timeouts.arangod)),
            events,
            kube,
        }
    }
}

/// Engine settings
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Scheduler floor
    pub min_interval: Interval,
    /// Scheduler ceiling
    pub max_interval: Interval,
    /// Operator-wide deadlines
    pub timeouts: Timeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL.into(),
            max_interval: DEFAULT_MAX_INTERVAL.into(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Engine for one ArangoDeployment
pub struct Deployment {
    namespace: String,
    name: String,
    uid: Option<String>,
    object: ArangoDeployment,
    deps: Arc<Collaborators>,
    status: Arc<StatusStore>,
    scheduler: InspectionScheduler,
    timeouts: Timeouts,
    steps: Vec<Box<dyn Step>>,
    node_count: usize,
    stop: CancellationToken,
}

impl Deployment {
    /// Create an engine seeded with the object's last persisted status
    pub fn new(
        object: ArangoDeployment,
        deps: Arc<Collaborators>,
        persister: Arc<dyn StatusPersister>,
        config: EngineConfig,
    ) -> Self {
        let namespace = object.namespace_or_default();
        let name = object.name_any();
        let status = Arc::new(StatusStore::new(
            name.clone(),
            object.status.clone().unwrap_or_default(),
            persister,
        ));
        Self {
            uid: object.uid(),
            namespace,
            name,
            object,
            deps,
            status,
            scheduler: InspectionScheduler::new(config.min_interval, config.max_interval),
            timeouts: config.timeouts,
            steps: default_steps(),
            node_count: 0,
            stop: CancellationToken::new(),
        }
    }

    /// Create an engine persisting its status into the status subresource
    pub fn with_kube_persister(
        object: ArangoDeployment,
        deps: Arc<Collaborators>,
        config: EngineConfig,
    ) -> Self {
        let persister = Arc::new(KubeStatusPersister::new(
            deps.kube.clone(),
            &object.namespace_or_default(),
            &object.name_any(),
        ));
        Self::new(object, deps, persister, config)
    }

    /// Namespace of the deployment
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the deployment
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Status store of the deployment
    pub fn status(&self) -> Arc<StatusStore> {
        self.status.clone()
    }

    /// Token cancelled once the engine should stop for good
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Scheduler floor
    pub fn floor(&self) -> Interval {
        self.scheduler.floor()
    }

    /// Interval after a quiet sleep
    pub fn relax(&self, last: Interval) -> Interval {
        self.scheduler.relax(last)
    }

    /// Move a fresh deployment into the Running phase
    pub async fn start(&self) -> Result<(), Error> {
        let changed = self
            .status
            .with_update(|s| {
                if s.phase != DeploymentPhase::None {
                    return false;
                }
                s.phase = DeploymentPhase::Running;
                true
            })
            .await?;
        if changed {
            info!(deployment = %self.name, "deployment is running");
        }
        Ok(())
    }

    /// Run one cycle and return the delay before the next one
    #[instrument(skip_all, fields(namespace = %self.namespace, deployment = %self.name))]
    pub async fn inspect_deployment(&mut self, last: Interval) -> Interval {
        let started = Instant::now();
        let deadline = self.timeouts.cycle(self.node_count);

        let result = tokio::time::timeout(deadline, self.run_cycle(last)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = Error::timeout("reconciliation cycle", deadline)
                    .in_step("Reconciliation timed out");
                error!(error = %err, "Reconciliation timed out");
                self.publish(
                    EventType::Warning,
                    reasons::RECONCILIATION_FAILED,
                    actions::RECONCILE,
                    err.to_string(),
                )
                .await;
                CycleOutcome::Failed
            }
        };

        let mut labels = deployment_labels(&self.namespace, &self.name);
        INSPECT_DEPLOYMENT_DURATION.record(started.elapsed().as_secs_f64(), &labels);
        labels.push(KeyValue::new("outcome", outcome.as_str()));
        INSPECT_DEPLOYMENT_CYCLES.add(1, &labels);
        self.record_metrics();

        let next = self.scheduler.complete(outcome);
        debug!(outcome = outcome.as_str(), next = ?next.as_duration(), "cycle finished");
        next
    }

    async fn run_cycle(&mut self, last: Interval) -> CycleOutcome {
        let cache = match self.deps.cache.refresh(&self.namespace, &self.name).await {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "Unable to refresh resource cache");
                return CycleOutcome::RetrySoon;
            }
        };
        self.node_count = cache.nodes().len();

        let Some(obj) = cache.deployment().cloned() else {
            info!("deployment is gone, stopping");
            self.stop.cancel();
            return CycleOutcome::Clean(last);
        };
        if let (Some(expected), Some(actual)) = (self.uid.as_deref(), obj.uid()) {
            if expected != actual {
                error!(expected, actual = %actual, "deployment UID changed, skipping cycle");
                return CycleOutcome::Clean(last);
            }
        }
        self.object = obj.clone();

        if obj.metadata.deletion_timestamp.is_some() {
            return match run_deployment_finalizers(
                self.deps.kube.as_ref(),
                &cache,
                &self.namespace,
                &self.name,
            )
            .await
            {
                Ok(()) => CycleOutcome::Clean(last),
                Err(e) => {
                    let err = e.in_step("ArangoDeployment finalizer inspection failed");
                    warn!(error = %err, "finalizer run failed");
                    self.publish(
                        EventType::Warning,
                        reasons::FINALIZER_FAILED,
                        actions::DELETE,
                        err.to_string(),
                    )
                    .await;
                    CycleOutcome::Failed
                }
            };
        }

        if obj.has_annotation(ANNOTATION_MAINTENANCE, "true") {
            debug!("maintenance annotation present, skipping cycle");
            return CycleOutcome::Clean(last);
        }

        if let Err(e) = add_finalizers(self.deps.kube.as_ref(), &obj).await {
            debug!(error = %e, "Unable to add finalizers");
        }

        if let Err(e) = self.restore_status(&obj).await {
            warn!(error = %e, "Unable to restore status");
            return CycleOutcome::RetrySoon;
        }

        if self.status.read().0.phase == DeploymentPhase::Failed {
            debug!("deployment failed, skipping cycle");
            return CycleOutcome::Clean(last);
        }

        let mut cx = CycleContext {
            namespace: &self.namespace,
            name: &self.name,
            deployment: &obj,
            cache: &cache,
            status: &self.status,
            timeouts: self.timeouts,
            min_interval: self.scheduler.floor(),
            next_interval: last,
            agency: None,
        };
        match run_steps(&self.steps, &self.deps, &mut cx).await {
            Ok(Flow::Continue) => CycleOutcome::Clean(cx.next_interval),
            Ok(Flow::RetrySoon) => CycleOutcome::RetrySoon,
            Err(e) if e.is_reconcile() => {
                debug!(error = %e, "reconcile needed");
                CycleOutcome::RetrySoon
            }
            Err(e) => {
                error!(error = %e, "Reconciliation loop failed");
                self.publish(
                    EventType::Warning,
                    reasons::RECONCILIATION_FAILED,
                    actions::RECONCILE,
                    e.to_string(),
                )
                .await;
                CycleOutcome::Failed
            }
        }
    }

    /// Re-persist the in-memory status if the stored one drifted
    async fn restore_status(&self, obj: &ArangoDeployment) -> Result<(), Error> {
        let (current, _) = self.status.read();
        let persisted = obj.status.clone().unwrap_or_default();
        if persisted == current {
            return Ok(());
        }
        info!("stored status differs from the in-memory one, restoring");
        STATUS_RESTORES.add(1, &deployment_labels(&self.namespace, &self.name));
        self.status.resync().await
    }

    /// Release the children of a deployment whose worker stops
    pub async fn teardown(&self) -> Result<(), Error> {
        let cache = self.deps.cache.refresh(&self.namespace, &self.name).await?;
        let kube = self.deps.kube.as_ref();
        let pods = remove_pod_finalizers(kube, &cache, &self.namespace).await?;
        let pvcs = remove_pvc_finalizers(kube, &cache, &self.namespace).await?;
        debug!(deployment = %self.name, ?pods, ?pvcs, "child finalizer cleanup");
        Ok(())
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        let reference = self.object.object_ref(&());
        self.deps
            .events
            .publish(&reference, type_, reason, action, Some(note))
            .await;
    }

    fn record_metrics(&self) {
        let (status, _) = self.status.read();
        let labels = deployment_labels(&self.namespace, &self.name);
        for &group in ServerGroup::for_mode(self.object.spec.mode) {
            let mut group_labels = labels.clone();
            group_labels.push(KeyValue::new("group", group.as_role()));
            DEPLOYMENT_MEMBERS.record(status.members.group(group).len() as i64, &group_labels);
        }
        let mut condition_labels = labels;
        condition_labels.push(KeyValue::new("condition", "UpToDate"));
        DEPLOYMENT_CONDITION.record(
            i64::from(status.conditions.is_true(ConditionType::UpToDate)),
            &condition_labels,
        );
    }
}
