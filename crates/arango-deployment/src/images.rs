//! Image discovery probe
//!
//! For an image reference without metadata, a disposable pod running that
//! image is started. Once ready, its resolved image ID is read from the pod
//! status and the server version is queried over HTTP. The result is
//! recorded in the deployment status and the probe pod is deleted.
//!
//! Per reference: Absent -> Launched -> (Failed -> Absent) -> Ready -> Resolved.

use std::time::Duration;

use arango_common::crd::{ArangoDeployment, ImageInfo};
use arango_common::kube_utils::{
    container_image_id, controller_owner_ref, ignore_not_found, is_pod_failed, is_pod_ready,
    short_hash,
};
use arango_common::{
    Error, ARANGOD_PORT, LABEL_APP, LABEL_APP_VALUE, LABEL_DEPLOYMENT, LABEL_ROLE,
    ROLE_IMAGE_DISCOVERY,
};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, Pod, PodSpec, SecurityContext,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::KubeClient;
use crate::pipeline::CycleContext;

/// Name of the server container in probe pods
pub const PROBE_CONTAINER: &str = "server";
/// How long a failed probe pod is kept before it is deleted
pub const FAILED_PROBE_GRACE: Duration = Duration::from_secs(30);

const PROBE_DATA_DIR: &str = "/data";
const PROBE_VOLUME: &str = "arangod-data";

/// Version endpoint response
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct VersionInfo {
    /// Server version, e.g. "3.12.1"
    pub version: String,
    /// "enterprise" or "community"
    #[serde(default)]
    pub license: String,
}

impl VersionInfo {
    /// Whether the server is an enterprise build
    pub fn is_enterprise(&self) -> bool {
        self.license == "enterprise"
    }
}

/// Queries the version endpoint of a probe pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionClient: Send + Sync {
    /// Fetch the version of the server at `pod_ip`
    async fn version(&self, pod_ip: &str) -> Result<VersionInfo, Error>;
}

/// Version client over plain HTTP; probe pods run without authentication
pub struct HttpVersionClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpVersionClient {
    /// Create a client with a per-request deadline
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

fn host_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

#[async_trait]
impl VersionClient for HttpVersionClient {
    async fn version(&self, pod_ip: &str) -> Result<VersionInfo, Error> {
        let url = format!("http://{}/_api/version?details=true", host_port(pod_ip, ARANGOD_PORT));
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::http(&url, e.to_string()))?;
        response
            .json::<VersionInfo>()
            .await
            .map_err(|e| Error::http(&url, e.to_string()))
    }
}

/// Result of one discovery attempt
#[derive(Clone, Debug, PartialEq)]
pub enum ImageLookup {
    /// Metadata was already known; nothing was written
    Resolved(ImageInfo),
    /// Metadata was discovered and recorded in this cycle
    Recorded(ImageInfo),
    /// A probe pod was created
    Launched,
    /// The probe pod exists but has no answer yet
    Pending,
    /// A failed probe pod was deleted and will be recreated
    Recreating,
}

/// Name of the probe pod for an image
pub fn probe_pod_name(deployment: &str, image: &str) -> String {
    format!("{}-id-{}", deployment, short_hash(image, 6))
}

/// Minimal pod that runs `image` with authentication disabled
pub fn build_probe_pod(owner: &ArangoDeployment, image: &str, pod_name: &str) -> Pod {
    let name = owner.name_or_default();
    let labels = [
        (LABEL_APP.to_string(), LABEL_APP_VALUE.to_string()),
        (LABEL_DEPLOYMENT.to_string(), name),
        (LABEL_ROLE.to_string(), ROLE_IMAGE_DISCOVERY.to_string()),
    ]
    .into();

    let container = Container {
        name: PROBE_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: owner.spec.image_pull_policy.clone(),
        command: Some(vec!["/usr/sbin/arangod".to_string()]),
        args: Some(vec![
            "--server.authentication=false".to_string(),
            format!("--server.endpoint=tcp://[::]:{}", ARANGOD_PORT),
            format!("--database.directory={}", PROBE_DATA_DIR),
            "--log.output=+".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("server".to_string()),
            container_port: i32::from(ARANGOD_PORT),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: PROBE_VOLUME.to_string(),
            mount_path: PROBE_DATA_DIR.to_string(),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let toleration = |key: &str| Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some("NoExecute".to_string()),
        toleration_seconds: Some(5),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: owner.metadata.namespace.clone(),
            labels: Some(labels),
            owner_references: controller_owner_ref(owner).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(30),
            volumes: Some(vec![Volume {
                name: PROBE_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            tolerations: Some(vec![
                toleration("node.kubernetes.io/not-ready"),
                toleration("node.kubernetes.io/unreachable"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Advance discovery for `image` by at most one state
pub async fn ensure_image(
    kube: &dyn KubeClient,
    versions: &dyn VersionClient,
    cx: &CycleContext<'_>,
    image: &str,
) -> Result<ImageLookup, Error> {
    if let Some(info) = cx.status.read().0.images.get(image) {
        return Ok(ImageLookup::Resolved(info.clone()));
    }

    let pod_name = probe_pod_name(cx.name, image);
    let Some(pod) = cx.cache.pod(&pod_name) else {
        let pod = build_probe_pod(cx.deployment, image, &pod_name);
        match kube.create_pod(cx.namespace, &pod).await {
            Ok(()) => {
                info!(pod = %pod_name, image, "created image discovery pod");
                return Ok(ImageLookup::Launched);
            }
            // created by a previous cycle but not yet in the snapshot
            Err(e) if e.is_conflict() => return Ok(ImageLookup::Pending),
            Err(e) => return Err(e),
        }
    };

    if is_pod_failed(pod) {
        let created = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
        let grace = chrono::Duration::from_std(FAILED_PROBE_GRACE).unwrap_or_default();
        if created.is_some_and(|c| c + grace > Utc::now()) {
            debug!(pod = %pod_name, "image discovery pod failed, waiting before removal");
            return Ok(ImageLookup::Pending);
        }
        ignore_not_found(kube.delete_pod(cx.namespace, &pod_name).await)?;
        info!(pod = %pod_name, image, "deleted failed image discovery pod");
        return Ok(ImageLookup::Recreating);
    }

    if !is_pod_ready(pod) {
        debug!(pod = %pod_name, "image discovery pod not ready");
        return Ok(ImageLookup::Pending);
    }

    let image_id = container_image_id(pod, PROBE_CONTAINER).unwrap_or_else(|| {
        debug!(pod = %pod_name, "no image ID reported, falling back to reference");
        image.to_string()
    });

    let Some(pod_ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
        debug!(pod = %pod_name, "image discovery pod has no IP yet");
        return Ok(ImageLookup::Pending);
    };

    let version = match versions.version(&pod_ip).await {
        Ok(v) => v,
        Err(e) => {
            debug!(pod = %pod_name, error = %e, "failed to query version of image discovery pod");
            return Ok(ImageLookup::Pending);
        }
    };

    if let Err(e) = ignore_not_found(kube.delete_pod(cx.namespace, &pod_name).await) {
        warn!(pod = %pod_name, error = %e, "failed to delete image discovery pod");
        return Ok(ImageLookup::Pending);
    }

    let info = ImageInfo {
        image: image.to_string(),
        image_id,
        arangodb_version: version.version.clone(),
        enterprise: version.is_enterprise(),
    };
    let recorded = info.clone();
    cx.status
        .with_update(move |status| {
            if status.current_image.is_none() {
                status.current_image = Some(info.clone());
            }
            status.images.add(info)
        })
        .await?;

    info!(
        image,
        image_id = %recorded.image_id,
        version = %recorded.arangodb_version,
        enterprise = recorded.enterprise,
        "discovered image"
    );
    Ok(ImageLookup::Recorded(recorded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::inspector::Inspector;
    use crate::testing::{cluster_deployment, cycle_context, recording_store};
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const IMAGE: &str = "arangodb/arangodb:3.12.1";

    fn probe(status: PodStatus, age: chrono::Duration) -> Pod {
        let owner = cluster_deployment();
        let mut pod = build_probe_pod(&owner, IMAGE, &probe_pod_name("cluster", IMAGE));
        pod.metadata.creation_timestamp = Some(Time(Utc::now() - age));
        pod.status = Some(status);
        pod
    }

    fn starting() -> PodStatus {
        PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }
    }

    fn ready(image_id: &str) -> PodStatus {
        PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some("10.0.0.7".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(vec![ContainerStatus {
                name: PROBE_CONTAINER.to_string(),
                image_id: image_id.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn failed() -> PodStatus {
        PodStatus {
            phase: Some("Failed".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn probe_pod_is_minimal_and_owned() {
        let owner = cluster_deployment();
        let name = probe_pod_name("cluster", IMAGE);
        assert!(name.starts_with("cluster-id-"));
        assert_eq!(name.len(), "cluster-id-".len() + 6);

        let pod = build_probe_pod(&owner, IMAGE, &name);
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].image.as_deref(), Some(IMAGE));
        assert!(spec.containers[0]
            .args
            .as_ref()
            .unwrap()
            .contains(&"--server.authentication=false".to_string()));
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap().get(LABEL_ROLE).map(String::as_str),
            Some(ROLE_IMAGE_DISCOVERY)
        );
        assert_eq!(pod.metadata.owner_references.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        assert_eq!(host_port("10.0.0.1", 8529), "10.0.0.1:8529");
        assert_eq!(host_port("fd00::1", 8529), "[fd00::1]:8529");
    }

    /// Absent -> Launched -> Pending -> Recorded over three cycles.
    #[tokio::test]
    async fn probe_lifecycle_over_three_cycles() {
        let (store, _) = recording_store();
        let owner = cluster_deployment();

        // cycle 1: no probe pod yet
        let mut kube = MockKubeClient::new();
        kube.expect_create_pod()
            .withf(|ns, pod| ns == "db" && pod.metadata.name.as_deref().is_some_and(|n| n.starts_with("cluster-id-")))
            .times(1)
            .returning(|_, _| Ok(()));
        let versions = MockVersionClient::new();
        let cache = Inspector::new(Some(owner.clone()));
        let cx = cycle_context(&owner, &cache, &store);
        assert_eq!(
            ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap(),
            ImageLookup::Launched
        );

        // cycle 2: pod still starting
        let kube = MockKubeClient::new();
        let cache = Inspector::new(Some(owner.clone()))
            .with_pods(vec![probe(starting(), chrono::Duration::seconds(5))]);
        let cx = cycle_context(&owner, &cache, &store);
        assert_eq!(
            ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap(),
            ImageLookup::Pending
        );

        // cycle 3: ready, version query succeeds
        let mut kube = MockKubeClient::new();
        kube.expect_delete_pod().times(1).returning(|_, _| Ok(()));
        let mut versions = MockVersionClient::new();
        versions
            .expect_version()
            .withf(|ip| ip == "10.0.0.7")
            .returning(|_| {
                Ok(VersionInfo {
                    version: "3.12.1".to_string(),
                    license: "enterprise".to_string(),
                })
            });
        let cache = Inspector::new(Some(owner.clone()))
            .with_pods(vec![probe(ready("docker-pullable://arangodb@sha256:feed"), chrono::Duration::seconds(20))]);
        let cx = cycle_context(&owner, &cache, &store);
        let lookup = ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap();

        let expected = ImageInfo {
            image: IMAGE.to_string(),
            image_id: "arangodb@sha256:feed".to_string(),
            arangodb_version: "3.12.1".to_string(),
            enterprise: true,
        };
        assert_eq!(lookup, ImageLookup::Recorded(expected.clone()));
        let (status, _) = store.read();
        assert_eq!(status.images.get(IMAGE), Some(&expected));
        assert_eq!(status.current_image, Some(expected));
    }

    #[tokio::test]
    async fn resolved_image_performs_no_writes() {
        let (store, persister) = recording_store();
        store
            .with_update(|s| {
                s.images.add(ImageInfo {
                    image: IMAGE.to_string(),
                    image_id: "sha256:1".to_string(),
                    arangodb_version: "3.12.1".to_string(),
                    enterprise: false,
                })
            })
            .await
            .unwrap();
        let writes = persister.count();
        let version = store.version();

        let owner = cluster_deployment();
        let cache = Inspector::new(Some(owner.clone()));
        let cx = cycle_context(&owner, &cache, &store);
        // no expectations: any platform call panics
        let kube = MockKubeClient::new();
        let versions = MockVersionClient::new();

        let lookup = ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap();
        assert!(matches!(lookup, ImageLookup::Resolved(ref i) if i.image_id == "sha256:1"));
        assert_eq!(store.version(), version);
        assert_eq!(persister.count(), writes);
    }

    #[tokio::test]
    async fn failed_probe_is_kept_during_grace_period() {
        let (store, _) = recording_store();
        let owner = cluster_deployment();
        let cache = Inspector::new(Some(owner.clone()))
            .with_pods(vec![probe(failed(), chrono::Duration::seconds(10))]);
        let cx = cycle_context(&owner, &cache, &store);
        let kube = MockKubeClient::new();
        let versions = MockVersionClient::new();
        assert_eq!(
            ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap(),
            ImageLookup::Pending
        );
    }

    #[tokio::test]
    async fn failed_probe_is_deleted_after_grace_period() {
        let (store, _) = recording_store();
        let owner = cluster_deployment();
        let cache = Inspector::new(Some(owner.clone()))
            .with_pods(vec![probe(failed(), chrono::Duration::seconds(45))]);
        let cx = cycle_context(&owner, &cache, &store);
        let mut kube = MockKubeClient::new();
        kube.expect_delete_pod().times(1).returning(|_, _| Ok(()));
        let versions = MockVersionClient::new();
        assert_eq!(
            ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap(),
            ImageLookup::Recreating
        );
    }

    #[tokio::test]
    async fn version_query_failure_leaves_probe_running() {
        let (store, _) = recording_store();
        let owner = cluster_deployment();
        let cache = Inspector::new(Some(owner.clone()))
            .with_pods(vec![probe(ready(""), chrono::Duration::seconds(20))]);
        let cx = cycle_context(&owner, &cache, &store);
        let mut kube = MockKubeClient::new();
        kube.expect_delete_pod().never();
        let mut versions = MockVersionClient::new();
        versions
            .expect_version()
            .returning(|_| Err(Error::http("10.0.0.7", "connection refused")));
        assert_eq!(
            ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap(),
            ImageLookup::Pending
        );
        assert!(store.read().0.images.is_empty());
    }

    #[tokio::test]
    async fn missing_image_id_falls_back_to_reference() {
        let (store, _) = recording_store();
        let owner = cluster_deployment();
        let cache = Inspector::new(Some(owner.clone()))
            .with_pods(vec![probe(ready(""), chrono::Duration::seconds(20))]);
        let cx = cycle_context(&owner, &cache, &store);
        let mut kube = MockKubeClient::new();
        kube.expect_delete_pod().returning(|_, _| Ok(()));
        let mut versions = MockVersionClient::new();
        versions.expect_version().returning(|_| {
            Ok(VersionInfo {
                version: "3.11.8".to_string(),
                license: "community".to_string(),
            })
        });
        let lookup = ensure_image(&kube, &versions, &cx, IMAGE).await.unwrap();
        match lookup {
            ImageLookup::Recorded(info) => {
                assert_eq!(info.image_id, IMAGE);
                assert!(!info.enterprise);
            }
            other => panic!("expected Recorded, got {other:?}"),
        }
    }
}
