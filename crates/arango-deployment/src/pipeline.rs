//! Ordered reconciliation steps of one cycle
//!
//! Each step either continues, asks for a quick retry, or fails. A retry or
//! failure aborts the remaining steps. The guard steps that decide whether a
//! cycle runs at all (owner gone, deletion, maintenance annotation, failed
//! phase) live in [`crate::deployment`]; everything after them is here.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use arango_common::crd::{ArangoDeployment, ConditionType, DeploymentMode, DeploymentStatus};
use arango_common::events::{actions, reasons};
use arango_common::metrics::{deployment_labels, AGENCY_ERRORS, AGENCY_FETCHES, AGENCY_INDEX};
use arango_common::timeouts::Timeouts;
use arango_common::{Error, ANNOTATION_PLAN_CLEAN};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, error, info, warn};

use crate::agency::{maintenance_refresh_due, AgencySnapshot};
use crate::deployment::Collaborators;
use crate::images::{ensure_image, ImageLookup};
use crate::inspector::Inspector;
use crate::interval::Interval;
use crate::resilience::check_member_failure;
use crate::status_store::StatusStore;

/// Everything a step may look at during one cycle
pub struct CycleContext<'a> {
    /// Namespace of the deployment
    pub namespace: &'a str,
    /// Name of the deployment
    pub name: &'a str,
    /// Owning object as seen at cycle start
    pub deployment: &'a ArangoDeployment,
    /// Snapshot refreshed at cycle start
    pub cache: &'a Inspector,
    /// Status of the deployment
    pub status: &'a StatusStore,
    /// Operator-wide deadlines
    pub timeouts: Timeouts,
    /// Scheduler floor
    pub min_interval: Interval,
    /// Interval before the next cycle; steps may only shrink it
    pub next_interval: Interval,
    /// Agency state, once refreshed in this cycle
    pub agency: Option<AgencySnapshot>,
}

impl CycleContext<'_> {
    /// Fold a step's interval request into the next interval
    pub fn reduce_interval(&mut self, hint: Option<Interval>) {
        self.next_interval = self.next_interval.reduce_to_opt(hint);
    }

    /// Reference to the owning object for events
    pub fn object_ref(&self) -> ObjectReference {
        self.deployment.object_ref(&())
    }
}

/// What the pipeline should do after a step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Run the next step
    Continue,
    /// Stop this cycle and come back at the floor interval
    RetrySoon,
}

/// One idempotent unit of a cycle
#[async_trait]
pub trait Step: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Run the step against the current snapshot
    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error>;
}

/// Steps in execution order
pub fn default_steps() -> Vec<Box<dyn Step>> {
    vec![
        Box::new(SpecDrift),
        Box::new(CoreResources),
        Box::new(Images),
        Box::new(InspectResources),
        Box::new(ImmediateActions),
        Box::new(EnsureResources),
        Box::new(AgencyRefresh),
        Box::new(MaintenanceLease),
        Box::new(PlanBuild),
        Box::new(UpToDate),
        Box::new(PlanExecute),
        Box::new(AccessAndMembers),
        Box::new(FinalSweep),
    ]
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `steps` in order until one retries or fails
///
/// A panicking step is turned into an internal error so the worker survives.
pub async fn run_steps(
    steps: &[Box<dyn Step>],
    deps: &Collaborators,
    cx: &mut CycleContext<'_>,
) -> Result<Flow, Error> {
    for step in steps {
        let result = AssertUnwindSafe(step.run(deps, cx)).catch_unwind().await;
        match result {
            Ok(Ok(Flow::Continue)) => {}
            Ok(Ok(Flow::RetrySoon)) => {
                debug!(deployment = %cx.name, step = step.name(), "step requested retry");
                return Ok(Flow::RetrySoon);
            }
            Ok(Err(e)) => return Err(e),
            Err(payload) => {
                let message = panic_message(payload);
                error!(deployment = %cx.name, step = step.name(), %message, "step panicked");
                return Err(Error::internal_with_context(step.name(), message)
                    .in_step("Reconciliation step panicked"));
            }
        }
    }
    Ok(Flow::Continue)
}

/// Whether the deployment is fully reconciled, with the reason if not
pub fn up_to_date_status(status: &DeploymentStatus, checksum: &str) -> (bool, &'static str) {
    if !status.plan.is_empty() {
        return (false, "Plan is not empty");
    }
    if status.applied_version != checksum {
        return (false, "Spec is not applied");
    }
    for (_, member) in status.members.iter() {
        if member.conditions.is_true(ConditionType::Restart)
            || member.conditions.is_true(ConditionType::PendingRestart)
        {
            return (false, "Pending restarts on members");
        }
        if member.conditions.is_true(ConditionType::PvcResizePending) {
            return (false, "PVC is resizing");
        }
    }
    (true, "")
}

/// Gate work on a spec that is about to be superseded
struct SpecDrift;

#[async_trait]
impl Step for SpecDrift {
    fn name(&self) -> &'static str {
        "spec-drift"
    }

    async fn run(&self, _deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        cx.deployment
            .spec
            .validate(cx.name)
            .map_err(|e| e.in_step("Spec validation failed"))?;
        let checksum = cx
            .deployment
            .spec
            .checksum()
            .map_err(|e| e.in_step("Calculation of spec failed"))?;

        let (status, _) = cx.status.read();
        if status.applied_version == checksum || status.conditions.is_false(ConditionType::UpToDate)
        {
            return Ok(Flow::Continue);
        }
        cx.status
            .with_update(|s| {
                s.conditions.update(
                    ConditionType::UpToDate,
                    false,
                    "Spec Changed",
                    "Spec Object changed. Waiting until plan will be applied",
                )
            })
            .await
            .map_err(|e| e.in_step("Unable to update UpToDate condition"))?;
        info!(deployment = %cx.name, "spec changed");
        Ok(Flow::RetrySoon)
    }
}

struct CoreResources;

#[async_trait]
impl Step for CoreResources {
    fn name(&self) -> &'static str {
        "core-resources"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        let hint = deps
            .resources
            .cleanup_terminated_pods(cx)
            .await
            .map_err(|e| e.in_step("Pod cleanup failed"))?;
        cx.reduce_interval(hint);

        if let Err(e) = deps.resources.ensure_core_resources(cx).await {
            error!(deployment = %cx.name, error = %e, "Unable to ensure core resources");
        }

        deps.resources
            .validate_secret_hashes(cx)
            .await
            .map_err(|e| e.in_step("Secret hash validation failed"))?;
        deps.resources
            .validate_license(cx)
            .await
            .map_err(|e| e.in_step("License validation failed"))?;

        if cx.status.read().0.conditions.is_true(ConditionType::SecretsChanged) {
            return Err(Error::internal_with_context(
                "secrets",
                "tracked secrets changed since last cycle",
            )
            .in_step("Secrets changed"));
        }
        Ok(Flow::Continue)
    }
}

struct Images;

#[async_trait]
impl Step for Images {
    fn name(&self) -> &'static str {
        "images"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        let image = cx.deployment.spec.image.clone();
        let lookup = ensure_image(deps.kube.as_ref(), deps.versions.as_ref(), cx, &image)
            .await
            .map_err(|e| e.in_step("Image detection failed"))?;
        match lookup {
            ImageLookup::Resolved(_) => Ok(Flow::Continue),
            ImageLookup::Recorded(info) => {
                deps.events
                    .publish(
                        &cx.object_ref(),
                        EventType::Normal,
                        reasons::IMAGE_DISCOVERED,
                        actions::DISCOVER,
                        Some(format!(
                            "Image {} is ArangoDB {} ({})",
                            info.image,
                            info.arangodb_version,
                            if info.enterprise { "enterprise" } else { "community" }
                        )),
                    )
                    .await;
                Ok(Flow::RetrySoon)
            }
            ImageLookup::Launched | ImageLookup::Pending | ImageLookup::Recreating => {
                Ok(Flow::RetrySoon)
            }
        }
    }
}

struct InspectResources;

#[async_trait]
impl Step for InspectResources {
    fn name(&self) -> &'static str {
        "inspect-resources"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        let hint = deps
            .resources
            .inspect_pods(cx)
            .await
            .map_err(|e| e.in_step("Pod inspection failed"))?;
        cx.reduce_interval(hint);

        let hint = deps
            .resources
            .inspect_pvcs(cx)
            .await
            .map_err(|e| e.in_step("PVC inspection failed"))?;
        cx.reduce_interval(hint);
        Ok(Flow::Continue)
    }
}

struct ImmediateActions;

#[async_trait]
impl Step for ImmediateActions {
    fn name(&self) -> &'static str {
        "immediate-actions"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        check_member_failure(cx.status, cx.cache)
            .await
            .map_err(|e| e.in_step("Member failure detection failed"))?;
        deps.plan
            .check_deployment(cx)
            .await
            .map_err(|e| e.in_step("Reconciler immediate actions failed"))?;
        Ok(Flow::Continue)
    }
}

struct EnsureResources;

#[async_trait]
impl Step for EnsureResources {
    fn name(&self) -> &'static str {
        "ensure-resources"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        if let Err(e) = deps.resources.ensure_resources(cx).await {
            error!(deployment = %cx.name, error = %e, "Unable to ensure resources");
        }
        Ok(Flow::Continue)
    }
}

struct AgencyRefresh;

#[async_trait]
impl Step for AgencyRefresh {
    fn name(&self) -> &'static str {
        "agency-refresh"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        if cx.deployment.spec.mode == DeploymentMode::Single {
            return Ok(Flow::Continue);
        }
        let labels = deployment_labels(cx.namespace, cx.name);
        AGENCY_FETCHES.add(1, &labels);
        match deps.agency.refresh(cx.namespace, cx.name).await {
            Ok(snapshot) => {
                AGENCY_INDEX.record(snapshot.index, &labels);
                cx.agency = Some(snapshot);
            }
            Err(e) => {
                AGENCY_ERRORS.add(1, &labels);
                error!(deployment = %cx.name, error = %e, "Unable to refresh agency");
            }
        }
        Ok(Flow::Continue)
    }
}

struct MaintenanceLease;

#[async_trait]
impl Step for MaintenanceLease {
    fn name(&self) -> &'static str {
        "maintenance-lease"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        if cx.deployment.spec.mode == DeploymentMode::Single {
            return Ok(Flow::Continue);
        }
        let grace = cx.deployment.spec.timeouts.maintenance_grace_period();
        let (status, _) = cx.status.read();
        let condition = status.conditions.get(ConditionType::MaintenanceMode);
        if !maintenance_refresh_due(condition, cx.agency.as_ref(), grace, Utc::now()) {
            return Ok(Flow::Continue);
        }

        if let Err(e) = deps.agency.set_maintenance(cx.namespace, cx.name, true).await {
            warn!(deployment = %cx.name, error = %e, "Unable to refresh maintenance lease");
            return Ok(Flow::Continue);
        }
        if let Err(e) = cx
            .status
            .with_update(|s| s.conditions.touch(ConditionType::MaintenanceMode))
            .await
        {
            warn!(deployment = %cx.name, error = %e, "Unable to record maintenance lease refresh");
        }
        info!(deployment = %cx.name, "refreshed maintenance lease");
        Ok(Flow::Continue)
    }
}

struct PlanBuild;

#[async_trait]
impl Step for PlanBuild {
    fn name(&self) -> &'static str {
        "plan-build"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        if cx.deployment.has_annotation_key(ANNOTATION_PLAN_CLEAN) {
            deps.kube
                .remove_deployment_annotation(cx.namespace, cx.name, ANNOTATION_PLAN_CLEAN)
                .await
                .map_err(|e| e.in_step("Unable to remove plan clean annotation"))?;
            cx.status
                .with_update(|s| {
                    let had_plan = !s.plan.is_empty();
                    s.plan.clear();
                    had_plan
                })
                .await
                .map_err(|e| e.in_step("Unable to clean plan"))?;
            info!(deployment = %cx.name, "plan cleaned on request");
            return Ok(Flow::Continue);
        }

        let changed = deps
            .plan
            .create_plan(cx)
            .await
            .map_err(|e| e.in_step("Plan creation failed"))?;
        if changed {
            info!(deployment = %cx.name, "Plan generated, reconciling");
            return Ok(Flow::RetrySoon);
        }
        Ok(Flow::Continue)
    }
}

struct UpToDate;

#[async_trait]
impl Step for UpToDate {
    fn name(&self) -> &'static str {
        "up-to-date"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        let checksum = cx
            .deployment
            .spec
            .checksum()
            .map_err(|e| e.in_step("Calculation of spec failed"))?;
        let (status, _) = cx.status.read();

        if status.plan.is_empty() && status.applied_version != checksum {
            let applied = checksum.clone();
            cx.status
                .with_update(move |s| {
                    s.applied_version = applied;
                    true
                })
                .await
                .map_err(|e| e.in_step("Unable to update applied version"))?;
            deps.events
                .publish(
                    &cx.object_ref(),
                    EventType::Normal,
                    reasons::SPEC_APPLIED,
                    actions::RECONCILE,
                    Some(format!("Spec {} applied", &checksum[..checksum.len().min(8)])),
                )
                .await;
            return Ok(Flow::RetrySoon);
        }

        let (up_to_date, reason) = up_to_date_status(&status, &checksum);
        let current = status.conditions.is_true(ConditionType::UpToDate);
        if up_to_date == current {
            return Ok(Flow::Continue);
        }
        let (reason, message) = if up_to_date {
            ("Spec is Up To Date", "Spec is Up To Date")
        } else {
            (
                reason,
                "There are pending operations in plan or members are in restart process",
            )
        };
        cx.status
            .with_update(|s| {
                s.conditions
                    .update(ConditionType::UpToDate, up_to_date, reason, message)
            })
            .await
            .map_err(|e| e.in_step("Unable to update UpToDate condition"))?;
        Ok(Flow::RetrySoon)
    }
}

struct PlanExecute;

#[async_trait]
impl Step for PlanExecute {
    fn name(&self) -> &'static str {
        "plan-execute"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        let more = deps
            .plan
            .execute_plan(cx)
            .await
            .map_err(|e| e.in_step("Plan execution failed"))?;
        if more {
            cx.next_interval = cx.next_interval.reduce_to(cx.min_interval);
        }
        Ok(Flow::Continue)
    }
}

struct AccessAndMembers;

#[async_trait]
impl Step for AccessAndMembers {
    fn name(&self) -> &'static str {
        "access-and-members"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        deps.resources
            .create_access_packages(cx)
            .await
            .map_err(|e| e.in_step("AccessPackage creation failed"))?;
        deps.resources
            .sync_members(cx)
            .await
            .map_err(|e| e.in_step("Removed member cleanup failed"))?;
        Ok(Flow::Continue)
    }
}

struct FinalSweep;

#[async_trait]
impl Step for FinalSweep {
    fn name(&self) -> &'static str {
        "final-sweep"
    }

    async fn run(&self, deps: &Collaborators, cx: &mut CycleContext<'_>) -> Result<Flow, Error> {
        let hint = deps
            .resources
            .cleanup_terminated_pods(cx)
            .await
            .map_err(|e| e.in_step("Pod cleanup failed"))?;
        cx.reduce_interval(hint);
        Ok(Flow::Continue)
    }
}
