//! ArangoDeployment status types
//!
//! The status is the engine's crash-safe memory: it is written through the
//! status store on every accepted mutation and read back on restart.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::conditions::{ConditionList, ConditionType};
use super::deployment::ServerGroup;

/// Deployment lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentPhase {
    /// Not yet picked up
    #[default]
    None,
    /// Initial members are being created
    Creating,
    /// Reconciling normally
    Running,
    /// Rolling to a new image
    Upgrading,
    /// Terminal failure; reconciliation is skipped
    Failed,
}

impl std::fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentPhase::None => "None",
            DeploymentPhase::Creating => "Creating",
            DeploymentPhase::Running => "Running",
            DeploymentPhase::Upgrading => "Upgrading",
            DeploymentPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Member lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MemberPhase {
    /// ID allocated, no resources yet
    #[default]
    None,
    /// Resources requested
    Pending,
    /// Pod created
    Created,
    /// Member failed and needs replacement
    Failed,
}

/// Discovered metadata for one image reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    /// Image reference as written in the spec
    pub image: String,
    /// Content-addressed image ID reported by the runtime
    #[serde(rename = "image-id")]
    pub image_id: String,
    /// ArangoDB version reported by the server
    #[serde(rename = "arangodb-version")]
    pub arangodb_version: String,
    /// Whether the image is an enterprise build
    #[serde(default)]
    pub enterprise: bool,
}

/// Image records, at most one per reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct ImageInfoList(Vec<ImageInfo>);

impl ImageInfoList {
    /// Look up by image reference
    pub fn get(&self, image: &str) -> Option<&ImageInfo> {
        self.0.iter().find(|i| i.image == image)
    }

    /// Insert a record unless one already exists for its reference
    ///
    /// Records are immutable once created; returns whether it was added.
    pub fn add(&mut self, info: ImageInfo) -> bool {
        if self.get(&info.image).is_some() {
            return false;
        }
        self.0.push(info);
        true
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no records exist
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// State of one cluster member
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Stable ID, unique within the deployment
    pub id: String,
    /// Lifecycle phase
    #[serde(default)]
    pub phase: MemberPhase,
    /// Member conditions
    #[serde(default)]
    pub conditions: ConditionList,
    /// Name of the member pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    /// UID of the member pod last observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_uid: Option<String>,
    /// Name of the member volume claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
    /// Image the member was created with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,
    /// When the member ID was allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl MemberStatus {
    /// Create a member in phase None
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Whether the member is scheduled for removal
    pub fn is_marked_to_remove(&self) -> bool {
        self.conditions.is_true(ConditionType::MarkedToRemove)
    }
}

/// Members by role group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct DeploymentMembers(BTreeMap<ServerGroup, Vec<MemberStatus>>);

impl DeploymentMembers {
    /// Members of one group, in allocation order
    pub fn group(&self, group: ServerGroup) -> &[MemberStatus] {
        self.0.get(&group).map(Vec::as_slice).unwrap_or_default()
    }

    /// Mutable members of one group
    pub fn group_mut(&mut self, group: ServerGroup) -> &mut Vec<MemberStatus> {
        self.0.entry(group).or_default()
    }

    /// Iterate all members with their group
    pub fn iter(&self) -> impl Iterator<Item = (ServerGroup, &MemberStatus)> {
        self.0
            .iter()
            .flat_map(|(group, members)| members.iter().map(move |m| (*group, m)))
    }

    /// Iterate all members mutably with their group
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ServerGroup, &mut MemberStatus)> {
        self.0
            .iter_mut()
            .flat_map(|(group, members)| members.iter_mut().map(move |m| (*group, m)))
    }

    /// Find a member by ID
    pub fn by_id(&self, id: &str) -> Option<(ServerGroup, &MemberStatus)> {
        self.iter().find(|(_, m)| m.id == id)
    }

    /// Find a member by ID, mutably
    pub fn by_id_mut(&mut self, id: &str) -> Option<&mut MemberStatus> {
        self.iter_mut().find(|(_, m)| m.id == id).map(|(_, m)| m)
    }

    /// Remove a member, returning whether it existed
    pub fn remove(&mut self, id: &str) -> bool {
        let mut removed = false;
        for members in self.0.values_mut() {
            let before = members.len();
            members.retain(|m| m.id != id);
            removed |= before != members.len();
        }
        self.0.retain(|_, members| !members.is_empty());
        removed
    }

    /// Total member count
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Whether there are no members
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind of corrective action
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ActionType {
    /// Allocate a new member
    AddMember,
    /// Flag a member for removal
    MarkToRemoveMember,
    /// Remove a flagged member and its resources
    RemoveMember,
}

/// One pending corrective action
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanAction {
    /// Unique action ID
    pub id: String,
    /// What to do
    #[serde(rename = "type")]
    pub type_: ActionType,
    /// Group the action applies to
    pub group: ServerGroup,
    /// Target member, if already known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    /// When the action was planned
    pub created_at: DateTime<Utc>,
}

/// Status of an ArangoDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: DeploymentPhase,

    /// Why the deployment is in its phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Checksum of the last fully reconciled spec
    #[serde(default)]
    pub applied_version: String,

    /// Members by group
    #[serde(default)]
    pub members: DeploymentMembers,

    /// Deployment conditions
    #[serde(default)]
    pub conditions: ConditionList,

    /// Pending corrective actions, executed front to back
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlanAction>,

    /// Discovered image metadata
    #[serde(default, rename = "arangodb-images")]
    pub images: ImageInfoList,

    /// Image currently running across the deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<ImageInfo>,

    /// Content hashes of tracked secrets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_hashes: BTreeMap<String, String>,
}
