//! Member failure detection

use arango_common::crd::{ConditionType, DeploymentStatus, MemberPhase};
use arango_common::Error;
use tracing::info;

use crate::inspector::Inspector;
use crate::status_store::StatusStore;

/// Flag members whose pod vanished after creation
fn mark_terminated(status: &mut DeploymentStatus, cache: &Inspector) -> bool {
    let mut changed = false;
    for (group, member) in status.members.iter_mut() {
        if member.phase != MemberPhase::Created {
            continue;
        }
        let Some(pod_name) = member.pod_name.as_deref() else {
            continue;
        };
        if cache.pod(pod_name).is_some() {
            continue;
        }
        if member.conditions.update(
            ConditionType::Terminated,
            true,
            "Pod does not exist",
            "",
        ) {
            info!(member = %member.id, %group, pod = %pod_name, "member pod is gone");
            changed = true;
        }
    }
    changed
}

/// Record failures of members detected from the current snapshot
pub async fn check_member_failure(status: &StatusStore, cache: &Inspector) -> Result<(), Error> {
    status.with_update(|s| mark_terminated(s, cache)).await?;
    Ok(())
}
