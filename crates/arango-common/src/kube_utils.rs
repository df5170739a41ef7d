//! Shared Kubernetes utilities using kube-rs

use std::fmt::Write as _;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Client, Config, Resource, ResourceExt};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients (watches use their own timeout)
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a client from the inferred config with explicit timeouts
pub async fn create_client_with_timeout(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> crate::Result<Client> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Hex encoded SHA-256 of the input
pub fn sha256_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    hex(digest::digest(&digest::SHA256, input).as_ref())
}

/// Short stable hash, usable in object names
///
/// First `len` hex characters of the SHA-256 of the input.
pub fn short_hash(input: &str, len: usize) -> String {
    let mut full = sha256_hex(input.as_bytes());
    full.truncate(len);
    full
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Map a not-found error to `Ok(None)`
pub fn ignore_not_found<T>(result: crate::Result<T>) -> crate::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Controller owner reference pointing at `owner`
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

/// Whether the object is owned by an object with the given UID
pub fn is_owned_by<K: ResourceExt>(obj: &K, owner_uid: &str) -> bool {
    obj.owner_references().iter().any(|r| r.uid == owner_uid)
}

/// Whether the pod reports the Ready condition as True
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the pod ended in failure
///
/// Either the pod phase is Failed or a container terminated non-zero.
pub fn is_pod_failed(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() == Some("Failed") {
        return true;
    }
    status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|c| c.state.as_ref().and_then(|s| s.terminated.as_ref()))
        .any(|t| t.exit_code != 0)
}

/// Whether the pod finished, successfully or not
pub fn is_pod_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Failed") | Some("Succeeded")
    )
}

/// Image ID reported for a named container, without runtime prefixes
pub fn container_image_id(pod: &Pod, container: &str) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == container)
        .map(|c| {
            c.image_id
                .trim_start_matches("docker-pullable://")
                .trim_start_matches("docker://")
                .to_string()
        })
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus,
    };

    fn pod_with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Default::default()
        }
    }

    #[test]
    fn sha256_is_stable_hex() {
        let h = sha256_hex(b"arangodb");
        assert_eq!(h.len(), 64);
        assert_eq!(h, sha256_hex(b"arangodb"));
        assert_eq!(short_hash("arangodb", 6), h[..6]);
    }

    #[test]
    fn ready_pod_detection() {
        let pod = pod_with_status(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_pod_ready(&pod));
        assert!(!is_pod_ready(&Pod::default()));
    }

    #[test]
    fn failed_pod_detection() {
        let failed_phase = pod_with_status(PodStatus {
            phase: Some("Failed".to_string()),
            ..Default::default()
        });
        assert!(is_pod_failed(&failed_phase));
        assert!(is_pod_terminated(&failed_phase));

        let crashed = pod_with_status(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "server".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: 1,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(is_pod_failed(&crashed));
        assert!(!is_pod_terminated(&crashed));
    }

    #[test]
    fn image_id_strips_runtime_prefix() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "server".to_string(),
                image_id: "docker-pullable://arangodb@sha256:1234".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            container_image_id(&pod, "server").as_deref(),
            Some("arangodb@sha256:1234")
        );
        assert_eq!(container_image_id(&pod, "sidecar"), None);
    }

    #[test]
    fn empty_image_id_is_none() {
        let pod = pod_with_status(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "server".to_string(),
                image_id: String::new(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(container_image_id(&pod, "server"), None);
    }

    #[test]
    fn not_found_is_ignored() {
        let nf: Result<(), Error> = Err(Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "not found".to_string(),
                reason: "NotFound".to_string(),
                code: 404,
            }),
        });
        assert!(matches!(ignore_not_found(nf), Ok(None)));
        assert!(ignore_not_found(Err::<(), _>(Error::internal("x"))).is_err());
    }
}
