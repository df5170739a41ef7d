//! Resource ensurer
//!
//! Keeps the platform objects around the members of a deployment in shape:
//! services, disruption budgets, tracked secret hashes, access packages,
//! and the member bookkeeping derived from pods and volume claims. Every
//! call is idempotent and safe to repeat each cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arango_common::crd::{
    ArangoDeployment, ConditionType, DeploymentMode, MemberPhase, ServerGroup,
};
use arango_common::kube_utils::{
    controller_owner_ref, ignore_not_found, is_pod_ready, is_pod_terminated, sha256_hex,
};
use arango_common::{
    Error, ARANGOD_PORT, LABEL_APP, LABEL_APP_VALUE, LABEL_DEPLOYMENT, LABEL_ROLE,
    ROLE_IMAGE_DISCOVERY,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::KubeClient;
use crate::interval::Interval;
use crate::pipeline::CycleContext;

/// Recheck delay while pods or volumes are still settling
pub const SETTLING_RECHECK: Duration = Duration::from_secs(5);

/// Key that must be present in a license secret
pub const LICENSE_TOKEN_KEY: &str = "token";

/// Key of the CA certificate copied into access packages
pub const CA_CERT_KEY: &str = "ca.crt";

/// Idempotent ensurers for the objects around the members
#[async_trait]
pub trait ResourceEnsurer: Send + Sync {
    /// Remove pods of members that terminated
    async fn cleanup_terminated_pods(&self, cx: &CycleContext<'_>)
        -> Result<Option<Interval>, Error>;

    /// Services every deployment needs
    async fn ensure_core_resources(&self, cx: &CycleContext<'_>) -> Result<(), Error>;

    /// Track content hashes of referenced secrets
    async fn validate_secret_hashes(&self, cx: &CycleContext<'_>) -> Result<(), Error>;

    /// Check the license secret, if one is configured
    async fn validate_license(&self, cx: &CycleContext<'_>) -> Result<(), Error>;

    /// Fold pod state into member status
    async fn inspect_pods(&self, cx: &CycleContext<'_>) -> Result<Option<Interval>, Error>;

    /// Fold volume claim state into member status
    async fn inspect_pvcs(&self, cx: &CycleContext<'_>) -> Result<Option<Interval>, Error>;

    /// Structural resources that are not on the critical path
    async fn ensure_resources(&self, cx: &CycleContext<'_>) -> Result<(), Error>;

    /// Access package secrets for datacenter sync
    async fn create_access_packages(&self, cx: &CycleContext<'_>) -> Result<(), Error>;

    /// Drop members marked for removal whose resources are gone
    async fn sync_members(&self, cx: &CycleContext<'_>) -> Result<(), Error>;
}

/// Resource ensurer backed by the Kubernetes API
pub struct KubeResources {
    kube: Arc<dyn KubeClient>,
}

impl KubeResources {
    /// Create an ensurer acting through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

fn labels(deployment: &str, role: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_DEPLOYMENT.to_string(), deployment.to_string()),
    ]);
    if let Some(role) = role {
        labels.insert(LABEL_ROLE.to_string(), role.to_string());
    }
    labels
}

fn owned_meta(owner: &ArangoDeployment, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: owner.metadata.namespace.clone(),
        labels: Some(labels),
        owner_references: controller_owner_ref(owner).map(|r| vec![r]),
        ..Default::default()
    }
}

fn service(
    owner: &ArangoDeployment,
    name: String,
    role: Option<&str>,
    headless: bool,
) -> Service {
    let deployment = owner.name_any();
    Service {
        metadata: owned_meta(owner, name, labels(&deployment, None)),
        spec: Some(ServiceSpec {
            cluster_ip: headless.then(|| "None".to_string()),
            publish_not_ready_addresses: headless.then_some(true),
            selector: Some(labels(&deployment, role)),
            ports: Some(vec![ServicePort {
                name: Some("server".to_string()),
                port: i32::from(ARANGOD_PORT),
                target_port: Some(IntOrString::Int(i32::from(ARANGOD_PORT))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Services of a deployment: client-facing, internal headless, agents
pub fn desired_services(owner: &ArangoDeployment) -> Vec<Service> {
    let name = owner.name_any();
    let client_role = match owner.spec.mode {
        DeploymentMode::Single => ServerGroup::Single.as_role(),
        DeploymentMode::Cluster => ServerGroup::Coordinators.as_role(),
    };
    let mut services = vec![
        service(owner, name.clone(), Some(client_role), false),
        service(owner, format!("{name}-int"), None, true),
    ];
    if owner.spec.mode == DeploymentMode::Cluster {
        services.push(service(
            owner,
            format!("{name}-agent"),
            Some(ServerGroup::Agents.as_role()),
            true,
        ));
    }
    services
}

/// One disruption budget per server group, allowing a single member down
pub fn desired_pdbs(owner: &ArangoDeployment) -> Vec<PodDisruptionBudget> {
    let name = owner.name_any();
    ServerGroup::for_mode(owner.spec.mode)
        .iter()
        .filter(|g| owner.spec.group_count(**g) > 1)
        .map(|&group| {
            let min_available = owner.spec.group_count(group).saturating_sub(1);
            PodDisruptionBudget {
                metadata: owned_meta(
                    owner,
                    format!("{name}-{}-pdb", group.as_role()),
                    labels(&name, Some(group.as_role())),
                ),
                spec: Some(PodDisruptionBudgetSpec {
                    min_available: Some(IntOrString::Int(min_available as i32)),
                    selector: Some(LabelSelector {
                        match_labels: Some(labels(&name, Some(group.as_role()))),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

/// Content hash over the sorted data of a secret
pub fn secret_hash(secret: &Secret) -> String {
    let mut bytes = Vec::new();
    for (key, value) in secret.data.iter().flatten() {
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&value.0);
        bytes.push(0);
    }
    for (key, value) in secret.string_data.iter().flatten() {
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
    }
    sha256_hex(&bytes)
}

fn secret_has_key(secret: &Secret, key: &str) -> bool {
    secret.data.as_ref().is_some_and(|d| d.contains_key(key))
        || secret.string_data.as_ref().is_some_and(|d| d.contains_key(key))
}

/// Secrets whose content is tracked by hash
fn tracked_secrets(owner: &ArangoDeployment) -> Vec<&str> {
    [
        owner.spec.auth.jwt_secret_name.as_deref(),
        owner.spec.tls.ca_secret_name.as_deref(),
        owner.spec.license.secret_name.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn settling(any: bool) -> Option<Interval> {
    any.then(|| Interval::new(SETTLING_RECHECK))
}

#[async_trait]
impl ResourceEnsurer for KubeResources {
    async fn cleanup_terminated_pods(
        &self,
        cx: &CycleContext<'_>,
    ) -> Result<Option<Interval>, Error> {
        let mut removed = false;
        for pod in cx.cache.pods().filter(|p| is_pod_terminated(p)) {
            // probe pods follow their own grace period
            if pod.labels().get(LABEL_ROLE).map(String::as_str) == Some(ROLE_IMAGE_DISCOVERY) {
                continue;
            }
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let name = pod.name_any();
            info!(pod = %name, "removing terminated pod");
            ignore_not_found(self.kube.delete_pod(cx.namespace, &name).await)?;
            removed = true;
        }
        Ok(settling(removed))
    }

    async fn ensure_core_resources(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        for svc in desired_services(cx.deployment) {
            let name = svc.name_any();
            if cx.cache.service(&name).is_some() {
                continue;
            }
            info!(service = %name, "creating service");
            self.kube.apply_service(cx.namespace, &svc).await?;
        }
        Ok(())
    }

    async fn validate_secret_hashes(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        let mut observed = BTreeMap::new();
        for name in tracked_secrets(cx.deployment) {
            let Some(secret) = cx.cache.secret(name) else {
                return Err(Error::reconcile(format!("secret {name} does not exist yet")));
            };
            observed.insert(name.to_string(), secret_hash(secret));
        }

        cx.status
            .with_update(|s| {
                let mut changed_secrets = Vec::new();
                for (name, hash) in &observed {
                    match s.secret_hashes.get(name) {
                        Some(stored) if stored == hash => {}
                        Some(_) => changed_secrets.push(name.clone()),
                        None => {}
                    }
                }
                let hashes_changed = s.secret_hashes != observed;
                s.secret_hashes = observed.clone();

                let condition = if changed_secrets.is_empty() {
                    s.conditions.is_true(ConditionType::SecretsChanged)
                        && s.conditions.update(ConditionType::SecretsChanged, false, "Secrets are stable", "")
                } else {
                    warn!(secrets = ?changed_secrets, "tracked secrets changed");
                    s.conditions.update(
                        ConditionType::SecretsChanged,
                        true,
                        "Secrets changed",
                        changed_secrets.join(", "),
                    )
                };
                hashes_changed || condition
            })
            .await?;
        Ok(())
    }

    async fn validate_license(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        let Some(name) = cx.deployment.spec.license.secret_name.as_deref() else {
            return Ok(());
        };
        let secret = cx.cache.secret(name).ok_or_else(|| {
            Error::validation_for_field(
                cx.name,
                "spec.license.secretName",
                format!("license secret {name} does not exist"),
            )
        })?;
        if !secret_has_key(secret, LICENSE_TOKEN_KEY) {
            return Err(Error::validation_for_field(
                cx.name,
                "spec.license.secretName",
                format!("license secret {name} has no {LICENSE_TOKEN_KEY} key"),
            ));
        }
        Ok(())
    }

    async fn inspect_pods(&self, cx: &CycleContext<'_>) -> Result<Option<Interval>, Error> {
        let cache = cx.cache;
        let mut not_ready = false;
        cx.status
            .with_update(|s| {
                let mut changed = false;
                for (_, member) in s.members.iter_mut() {
                    let Some(pod) = member.pod_name.as_deref().and_then(|p| cache.pod(p)) else {
                        continue;
                    };
                    // the recorded UID is what a pending restart is checked against
                    let uid = pod.uid();
                    let restarting = member.conditions.is_true(ConditionType::PendingRestart);
                    if !restarting && uid.is_some() && member.pod_uid != uid {
                        member.pod_uid = uid;
                        changed = true;
                    }
                    if member.phase != MemberPhase::Created {
                        member.phase = MemberPhase::Created;
                        changed = true;
                    }
                    let ready = is_pod_ready(pod);
                    not_ready |= !ready;
                    let reason = if ready { "Pod Ready" } else { "Pod Not Ready" };
                    changed |= member.conditions.update(ConditionType::Ready, ready, reason, "");
                    if ready {
                        changed |= member.conditions.remove(ConditionType::Terminated);
                    }
                }
                changed
            })
            .await?;
        Ok(settling(not_ready))
    }

    async fn inspect_pvcs(&self, cx: &CycleContext<'_>) -> Result<Option<Interval>, Error> {
        let cache = cx.cache;
        let mut resizing = false;
        cx.status
            .with_update(|s| {
                let mut changed = false;
                for (_, member) in s.members.iter_mut() {
                    let Some(pvc) = member
                        .persistent_volume_claim_name
                        .as_deref()
                        .and_then(|p| cache.pvc(p))
                    else {
                        continue;
                    };
                    let pending = pvc
                        .status
                        .as_ref()
                        .and_then(|st| st.conditions.as_ref())
                        .is_some_and(|conds| {
                            conds.iter().any(|c| {
                                c.status == "True"
                                    && (c.type_ == "FileSystemResizePending" || c.type_ == "Resizing")
                            })
                        });
                    resizing |= pending;
                    changed |= if pending {
                        member.conditions.update(
                            ConditionType::PvcResizePending,
                            true,
                            "PVC Resize Pending",
                            "",
                        )
                    } else {
                        member.conditions.remove(ConditionType::PvcResizePending)
                    };
                }
                changed
            })
            .await?;
        Ok(settling(resizing))
    }

    async fn ensure_resources(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        for pdb in desired_pdbs(cx.deployment) {
            debug!(pdb = %pdb.name_any(), "applying pod disruption budget");
            self.kube.apply_pdb(cx.namespace, &pdb).await?;
        }
        Ok(())
    }

    async fn create_access_packages(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        let spec = &cx.deployment.spec;
        let missing: Vec<&String> = spec
            .sync
            .access_package_secret_names
            .iter()
            .filter(|n| cx.cache.secret(n).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let ca_name = spec.tls.ca_secret_name.as_deref().ok_or_else(|| {
            Error::validation_for_field(
                cx.name,
                "spec.tls.caSecretName",
                "access packages require a CA secret",
            )
        })?;
        let ca_cert = cx
            .cache
            .secret(ca_name)
            .and_then(|s| s.data.as_ref())
            .and_then(|d| d.get(CA_CERT_KEY))
            .cloned()
            .ok_or_else(|| Error::reconcile(format!("CA secret {ca_name} is not ready")))?;

        for name in missing {
            let secret = Secret {
                metadata: owned_meta(cx.deployment, name.clone(), labels(cx.name, None)),
                data: Some(BTreeMap::from([(CA_CERT_KEY.to_string(), ca_cert.clone())])),
                type_: Some("Opaque".to_string()),
                ..Default::default()
            };
            info!(secret = %name, "creating access package");
            self.kube.apply_secret(cx.namespace, &secret).await?;
        }
        Ok(())
    }

    async fn sync_members(&self, cx: &CycleContext<'_>) -> Result<(), Error> {
        let cache = cx.cache;
        cx.status
            .with_update(|s| {
                let planned: Vec<String> =
                    s.plan.iter().filter_map(|a| a.member_id.clone()).collect();
                let gone: Vec<String> = s
                    .members
                    .iter()
                    .filter(|(_, m)| m.is_marked_to_remove() && !planned.contains(&m.id))
                    .filter(|(_, m)| {
                        m.pod_name.as_deref().and_then(|p| cache.pod(p)).is_none()
                            && m
                                .persistent_volume_claim_name
                                .as_deref()
                                .and_then(|p| cache.pvc(p))
                                .is_none()
                    })
                    .map(|(_, m)| m.id.clone())
                    .collect();
                for id in &gone {
                    info!(member = %id, "removing obsolete member");
                    s.members.remove(id);
                }
                !gone.is_empty()
            })
            .await?;
        Ok(())
    }
}
