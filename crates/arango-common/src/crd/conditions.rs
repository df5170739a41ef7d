//! Named boolean conditions carried by deployments and members

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// Known condition types
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ConditionType {
    /// Member is ready
    Ready,
    /// Member pod terminated
    Terminated,
    /// Member pod is terminating
    Terminating,
    /// Agent member lost its data and needs recovery
    AgentRecoveryNeeded,
    /// Member restart scheduled but not yet executed
    PendingRestart,
    /// Member must be restarted
    Restart,
    /// Member is scheduled for removal
    MarkedToRemove,
    /// Member volume resize is pending
    #[serde(rename = "PVCResizePending")]
    PvcResizePending,
    /// Deployment matches its spec
    UpToDate,
    /// A tracked secret changed content
    SecretsChanged,
    /// Cluster supervision is in maintenance mode
    MaintenanceMode,
}

/// A single condition with transition metadata
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: ConditionType,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: DateTime<Utc>,

    /// Last time the condition was written, even without a transition
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            last_update_time: now,
        }
    }

    /// Whether the condition status is True
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Set of conditions keyed by type
///
/// Serialized as a plain list; at most one entry per [`ConditionType`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct ConditionList(Vec<Condition>);

impl ConditionList {
    /// Look up a condition by type
    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// True only when the condition exists and is True
    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_).is_some_and(Condition::is_true)
    }

    /// True only when the condition exists and is False
    pub fn is_false(&self, type_: ConditionType) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::False)
    }

    /// Set a condition, returning whether anything changed
    ///
    /// The transition time only moves when the status flips.
    pub fn update(
        &mut self,
        type_: ConditionType,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> bool {
        let status = ConditionStatus::from(status);
        let reason = reason.into();
        let message = message.into();
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                let now = Utc::now();
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                existing.last_update_time = now;
                true
            }
            None => {
                self.0.push(Condition::new(type_, status, reason, message));
                true
            }
        }
    }

    /// Bump the update time of an existing condition
    pub fn touch(&mut self, type_: ConditionType) -> bool {
        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(c) => {
                c.last_update_time = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove a condition, returning whether it existed
    pub fn remove(&mut self, type_: ConditionType) -> bool {
        let before = self.0.len();
        self.0.retain(|c| c.type_ != type_);
        before != self.0.len()
    }

    /// Iterate over all conditions
    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    /// Number of conditions
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no conditions are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
