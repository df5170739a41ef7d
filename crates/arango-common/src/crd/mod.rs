//! Custom Resource Definitions for the ArangoDB operator

mod conditions;
mod deployment;
mod status;

pub use conditions::{Condition, ConditionList, ConditionStatus, ConditionType};
pub use deployment::{
    ArangoDeployment, AuthenticationSpec, DeploymentMode, DeploymentSpec, DeploymentTimeouts,
    LicenseSpec, ServerGroup, ServerGroupSpec, SyncSpec, TlsSpec,
    DEFAULT_MAINTENANCE_GRACE_PERIOD,
};
pub use status::{
    ActionType, DeploymentMembers, DeploymentPhase, DeploymentStatus, ImageInfo, ImageInfoList,
    MemberPhase, MemberStatus, PlanAction,
};
