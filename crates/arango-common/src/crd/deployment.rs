//! ArangoDeployment CRD
//!
//! One `ArangoDeployment` describes one managed ArangoDB cluster. The spec
//! declares the image and per-group member counts; the status (see
//! [`super::status`]) is owned by the reconciliation engine.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::DeploymentStatus;
use crate::kube_utils::sha256_hex;
use crate::Error;

/// Topology of the managed database
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentMode {
    /// One standalone server
    Single,
    /// Agents, db-servers and coordinators
    #[default]
    Cluster,
}

/// Role group a member belongs to
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum ServerGroup {
    /// Standalone server
    Single,
    /// Raft agency members
    Agents,
    /// Data-bearing servers
    #[serde(rename = "dbservers")]
    DbServers,
    /// Stateless query coordinators
    Coordinators,
}

impl ServerGroup {
    /// Groups present in the given mode, in startup order
    pub fn for_mode(mode: DeploymentMode) -> &'static [ServerGroup] {
        match mode {
            DeploymentMode::Single => &[ServerGroup::Single],
            DeploymentMode::Cluster => &[
                ServerGroup::Agents,
                ServerGroup::DbServers,
                ServerGroup::Coordinators,
            ],
        }
    }

    /// Role label value used on pods
    pub fn as_role(&self) -> &'static str {
        match self {
            ServerGroup::Single => "single",
            ServerGroup::Agents => "agent",
            ServerGroup::DbServers => "dbserver",
            ServerGroup::Coordinators => "coordinator",
        }
    }

    /// Member ID prefix for newly allocated members
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ServerGroup::Single => "SNGL",
            ServerGroup::Agents => "AGNT",
            ServerGroup::DbServers => "PRMR",
            ServerGroup::Coordinators => "CRDN",
        }
    }

    /// Whether members of this group own a persistent volume
    pub fn is_stateful(&self) -> bool {
        !matches!(self, ServerGroup::Coordinators)
    }
}

impl std::fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_role())
    }
}

/// Per-group settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupSpec {
    /// Number of members; defaults depend on the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

/// License configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSpec {
    /// Secret holding the license under the `token` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Authentication configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Secret holding the cluster JWT signing secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_name: Option<String>,
}

/// TLS configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding the CA certificate used to sign server certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

/// Access package configuration for external datacenter sync
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Names of secrets to populate with the cluster CA for remote consumers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_package_secret_names: Vec<String>,
}

/// Timeouts tunable per deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTimeouts {
    /// How long a maintenance-mode lease is trusted before being re-asserted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_grace_period_seconds: Option<u64>,
}

/// Default maintenance grace period
pub const DEFAULT_MAINTENANCE_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

impl DeploymentTimeouts {
    /// Effective maintenance grace period
    pub fn maintenance_grace_period(&self) -> Duration {
        self.maintenance_grace_period_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAINTENANCE_GRACE_PERIOD)
    }
}

/// Specification for an ArangoDB deployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "database.arangodb.com",
    version = "v1",
    kind = "ArangoDeployment",
    plural = "arangodeployments",
    shortname = "arango",
    namespaced,
    status = "DeploymentStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Mode","type":"string","jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Deployment topology
    #[serde(default)]
    pub mode: DeploymentMode,

    /// ArangoDB image reference
    pub image: String,

    /// Pull policy for all containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Single server settings (Single mode)
    #[serde(default)]
    pub single: ServerGroupSpec,

    /// Agent settings (Cluster mode)
    #[serde(default)]
    pub agents: ServerGroupSpec,

    /// DB-server settings (Cluster mode)
    #[serde(default)]
    pub dbservers: ServerGroupSpec,

    /// Coordinator settings (Cluster mode)
    #[serde(default)]
    pub coordinators: ServerGroupSpec,

    /// License settings
    #[serde(default)]
    pub license: LicenseSpec,

    /// Authentication settings
    #[serde(default)]
    pub auth: AuthenticationSpec,

    /// TLS settings
    #[serde(default)]
    pub tls: TlsSpec,

    /// Datacenter sync access packages
    #[serde(default)]
    pub sync: SyncSpec,

    /// Timeouts
    #[serde(default)]
    pub timeouts: DeploymentTimeouts,
}

impl DeploymentSpec {
    /// Desired member count for a group
    pub fn group_count(&self, group: ServerGroup) -> u32 {
        if !ServerGroup::for_mode(self.mode).contains(&group) {
            return 0;
        }
        match group {
            ServerGroup::Single => 1,
            ServerGroup::Agents => self.agents.count.unwrap_or(3),
            ServerGroup::DbServers => self.dbservers.count.unwrap_or(3),
            ServerGroup::Coordinators => self.coordinators.count.unwrap_or(3),
        }
    }

    /// Validate the spec
    pub fn validate(&self, name: &str) -> crate::Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::validation_for_field(
                name,
                "spec.image",
                "image must not be empty",
            ));
        }
        if self.mode == DeploymentMode::Cluster {
            let agents = self.group_count(ServerGroup::Agents);
            if agents == 0 || agents % 2 == 0 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.agents.count",
                    "agent count must be odd (1, 3, 5, ...)",
                ));
            }
            if self.group_count(ServerGroup::DbServers) < 1 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.dbservers.count",
                    "at least one dbserver is required",
                ));
            }
            if self.group_count(ServerGroup::Coordinators) < 1 {
                return Err(Error::validation_for_field(
                    name,
                    "spec.coordinators.count",
                    "at least one coordinator is required",
                ));
            }
        }
        Ok(())
    }

    /// Checksum identifying this exact spec
    ///
    /// Stored as `appliedVersion` once the spec is fully reconciled.
    pub fn checksum(&self) -> crate::Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(sha256_hex(&bytes))
    }
}

impl ArangoDeployment {
    /// Namespace of the deployment, empty if unset
    pub fn namespace_or_default(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_default()
    }

    /// Name of the deployment, empty if unset
    pub fn name_or_default(&self) -> String {
        self.metadata.name.clone().unwrap_or_default()
    }

    /// Whether the object carries an annotation with the given value
    pub fn has_annotation(&self, key: &str, value: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .is_some_and(|v| v == value)
    }

    /// Whether the object carries an annotation with any value
    pub fn has_annotation_key(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(key))
    }
}
