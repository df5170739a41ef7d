//! Corrective plan engine
//!
//! A plan is an ordered queue of [`PlanAction`]s persisted in the deployment
//! status. It is built in one cycle and executed one action per cycle in
//! later ones, so the engine always re-observes between deciding and acting.

use std::sync::Arc;

use arango_common::crd::{
    ActionType, ConditionType, DeploymentStatus, MemberPhase, MemberStatus, PlanAction,
    ServerGroup,
};
use arango_common::kube_utils::ignore_not_found;
use arango_common::Error;
use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::client::KubeClient;
use crate::pipeline::CycleContext;

/// Builds and executes the corrective plan
#[async_trait]
pub trait PlanEngine: Send + Sync {
    /// Immediate actions that do not go through the plan
    async fn check_deployment(&self, cx: &CycleContext<'_>) -> Result<(), Error>;

    /// (Re)build the plan; returns whether it changed
    async fn create_plan(&self, cx: &CycleContext<'_>) -> Result<bool, Error>;

    /// Execute one unit of work; returns whether more work remains
    async fn execute_plan(&self, cx: &CycleContext<'_>) -> Result<bool, Error>;
}

/// Plan engine that scales server groups to their configured counts
pub struct ScalePlanEngine {
    kube: Arc<dyn KubeClient>,
}

impl ScalePlanEngine {
    /// Create an engine acting through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

fn random_hex() -> String {
    format!("{:08x}", rand::random::<u32>())
}

fn action(type_: ActionType, group: ServerGroup, member_id: Option<String>) -> PlanAction {
    PlanAction {
        id: random_hex(),
        type_,
        group,
        member_id,
        created_at: Utc::now(),
    }
}

/// Actions that move member counts towards the desired ones
fn scale_actions(cx: &CycleContext<'_>, status: &DeploymentStatus) -> Vec<PlanAction> {
    let spec = &cx.deployment.spec;
    let mut plan = Vec::new();
    for &group in ServerGroup::for_mode(spec.mode) {
        let members = status.members.group(group);

        // members flagged earlier still need their removal
        for m in members.iter().filter(|m| m.is_marked_to_remove()) {
            plan.push(action(ActionType::RemoveMember, group, Some(m.id.clone())));
        }

        let active: Vec<&MemberStatus> =
            members.iter().filter(|m| !m.is_marked_to_remove()).collect();
        let desired = spec.group_count(group) as usize;
        if active.len() < desired {
            for _ in active.len()..desired {
                plan.push(action(ActionType::AddMember, group, None));
            }
        } else {
            // newest members go first
            for m in active.iter().rev().take(active.len() - desired) {
                plan.push(action(ActionType::MarkToRemoveMember, group, Some(m.id.clone())));
                plan.push(action(ActionType::RemoveMember, group, Some(m.id.clone())));
            }
        }
    }
    plan
}

/// Drop the front action if it is still `id`
fn pop_action(status: &mut DeploymentStatus, id: &str) -> bool {
    if status.plan.first().is_some_and(|a| a.id == id) {
        status.plan.remove(0);
        true
    } else {
        false
    }
}

fn new_member(cx: &CycleContext<'_>, group: ServerGroup) -> MemberStatus {
    let id = format!("{}-{}", group.id_prefix(), random_hex());
    let base = format!("{}-{}-{}", cx.name, group.as_role(), id.to_lowercase());
    MemberStatus {
        phase: MemberPhase::Pending,
        pod_name: Some(base.clone()),
        persistent_volume_claim_name: group.is_stateful().then_some(base),
        image: None,
        ..MemberStatus::new(id)
    }
}

impl ScalePlanEngine {
    async fn remove_member(
        &self,
        cx: &CycleContext<'_>,
        action: &PlanAction,
        member: &MemberStatus,
    ) -> Result<bool, Error> {
        if let Some(pod) = member.pod_name.as_deref().filter(|p| cx.cache.pod(p).is_some()) {
            info!(member = %member.id, pod, "deleting member pod");
            ignore_not_found(self.kube.delete_pod(cx.namespace, pod).await)?;
            return Ok(true);
        }
        if let Some(pvc) = member
            .persistent_volume_claim_name
            .as_deref()
            .filter(|p| cx.cache.pvc(p).is_some())
        {
            info!(member = %member.id, pvc, "deleting member volume claim");
            ignore_not_found(self.kube.delete_pvc(cx.namespace, pvc).await)?;
            return Ok(true);
        }

        let member_id = member.id.clone();
        let action_id = action.id.clone();
        cx.status
            .with_update(|s| {
                let removed = s.members.remove(&member_id);
                pop_action(s, &action_id) || removed
            })
            .await?;
        info!(member = %member_id, group = %action.group, "removed member");
        Ok(!cx.status.read().0.plan.is_empty())
    }
}

#[async_trait]
impl PlanEngine for ScalePlanEngine {
    async fn check_deployment(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        let cache = cx.cache;
        cx.status
            .with_update(|s| {
                let mut changed = false;
                for (_, member) in s.members.iter_mut() {
                    if !member.conditions.is_true(ConditionType::PendingRestart) {
                        continue;
                    }
                    let current_uid = member
                        .pod_name
                        .as_deref()
                        .and_then(|p| cache.pod(p))
                        .and_then(|p| p.uid());
                    if current_uid.is_some() && current_uid != member.pod_uid {
                        debug!(member = %member.id, "pod restarted, clearing pending restart");
                        changed |= member.conditions.remove(ConditionType::PendingRestart);
                    }
                }
                changed
            })
            .await?;
        Ok(())
    }

    async fn create_plan(&self, cx: &CycleContext<'_>) -> Result<bool, Error> {
        let (status, _) = cx.status.read();
        if !status.plan.is_empty() {
            return Ok(false);
        }
        let actions = scale_actions(cx, &status);
        if actions.is_empty() {
            return Ok(false);
        }
        let count = actions.len();
        let changed = cx
            .status
            .with_update(move |s| {
                if !s.plan.is_empty() {
                    return false;
                }
                s.plan = actions;
                true
            })
            .await?;
        if changed {
            info!(deployment = %cx.name, actions = count, "created scale plan");
        }
        Ok(changed)
    }

    async fn execute_plan(&self, cx: &CycleContext<'_>) -> Result<bool, Error> {
        let (status, _) = cx.status.read();
        let Some(action) = status.plan.first().cloned() else {
            return Ok(false);
        };
        debug!(action = ?action.type_, group = %action.group, "executing plan action");

        match action.type_ {
            ActionType::AddMember => {
                let member = new_member(cx, action.group);
                let id = member.id.clone();
                cx.status
                    .with_update(|s| {
                        s.members.group_mut(action.group).push(member);
                        pop_action(s, &action.id);
                        true
                    })
                    .await?;
                info!(member = %id, group = %action.group, "added member");
            }
            ActionType::MarkToRemoveMember => {
                let member_id = action.member_id.clone().unwrap_or_default();
                cx.status
                    .with_update(|s| {
                        let marked = s.members.by_id_mut(&member_id).is_some_and(|m| {
                            m.conditions
                                .update(ConditionType::MarkedToRemove, true, "Scale down", "")
                        });
                        pop_action(s, &action.id) || marked
                    })
                    .await?;
            }
            ActionType::RemoveMember => {
                let member = action
                    .member_id
                    .as_deref()
                    .and_then(|id| status.members.by_id(id))
                    .map(|(_, m)| m.clone());
                match member {
                    Some(member) => return self.remove_member(cx, &action, &member).await,
                    None => {
                        cx.status.with_update(|s| pop_action(s, &action.id)).await?;
                    }
                }
            }
        }
        Ok(!cx.status.read().0.plan.is_empty())
    }
}
