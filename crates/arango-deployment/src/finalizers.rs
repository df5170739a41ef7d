//! Cascading finalizer protocol
//!
//! Every ArangoDeployment carries [`FINALIZER_REMOVE_CHILD_FINALIZERS`].
//! While the deployment is being deleted the token stays in place until a
//! cycle observes that no child pod or volume claim still carries a
//! finalizer. Removal of the token is a single get/mutate/update attempt
//! guarded by the resource version; on conflict it is retried next cycle.

use arango_common::crd::ArangoDeployment;
use arango_common::{Error, FINALIZER_REMOVE_CHILD_FINALIZERS};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::client::KubeClient;
use crate::inspector::Inspector;

/// Finalizer set with the protective token present
///
/// Returns `None` when the token is already there.
pub fn ensure_finalizers(obj: &ArangoDeployment) -> Option<Vec<String>> {
    let current = obj.finalizers();
    if current
        .iter()
        .any(|f| f == FINALIZER_REMOVE_CHILD_FINALIZERS)
    {
        return None;
    }
    let mut finalizers = current.to_vec();
    finalizers.push(FINALIZER_REMOVE_CHILD_FINALIZERS.to_string());
    Some(finalizers)
}

/// Add the protective token to the owning object if missing
pub async fn add_finalizers(kube: &dyn KubeClient, obj: &ArangoDeployment) -> Result<bool, Error> {
    let Some(finalizers) = ensure_finalizers(obj) else {
        return Ok(false);
    };
    kube.set_deployment_finalizers(
        &obj.namespace_or_default(),
        &obj.name_any(),
        finalizers,
        obj.resource_version(),
    )
    .await?;
    Ok(true)
}

/// Outcome of one removal predicate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cleanup {
    /// No child carried a finalizer in this snapshot
    Clear,
    /// Finalizers were removed; must be re-observed before the owner is released
    Pending,
}

/// Clear finalizers of every child pod seen in the snapshot
pub async fn remove_pod_finalizers(
    kube: &dyn KubeClient,
    cache: &Inspector,
    namespace: &str,
) -> Result<Cleanup, Error> {
    let mut outcome = Cleanup::Clear;
    for pod in cache.pods().filter(|p| !p.finalizers().is_empty()) {
        let name = pod.name_any();
        debug!(pod = %name, "removing pod finalizers");
        kube.remove_pod_finalizers(namespace, &name).await?;
        outcome = Cleanup::Pending;
    }
    Ok(outcome)
}

/// Clear finalizers of every child volume claim seen in the snapshot
pub async fn remove_pvc_finalizers(
    kube: &dyn KubeClient,
    cache: &Inspector,
    namespace: &str,
) -> Result<Cleanup, Error> {
    let mut outcome = Cleanup::Clear;
    for pvc in cache.pvcs().filter(|p| !p.finalizers().is_empty()) {
        let name = pvc.name_any();
        debug!(pvc = %name, "removing pvc finalizers");
        kube.remove_pvc_finalizers(namespace, &name).await?;
        outcome = Cleanup::Pending;
    }
    Ok(outcome)
}

/// Removal predicates guarding [`FINALIZER_REMOVE_CHILD_FINALIZERS`]
///
/// Every predicate runs even if an earlier one is pending.
async fn remove_child_finalizers(
    kube: &dyn KubeClient,
    cache: &Inspector,
    namespace: &str,
) -> Result<Cleanup, Error> {
    let pods = remove_pod_finalizers(kube, cache, namespace).await?;
    let pvcs = remove_pvc_finalizers(kube, cache, namespace).await?;
    if pods == Cleanup::Clear && pvcs == Cleanup::Clear {
        Ok(Cleanup::Clear)
    } else {
        Ok(Cleanup::Pending)
    }
}

/// Run the deletion finalizers of a deployment marked for deletion
///
/// Predicate failures leave the token in place and are only logged. An
/// error is returned only when the owner update itself fails.
pub async fn run_deployment_finalizers(
    kube: &dyn KubeClient,
    cache: &Inspector,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let Some(obj) = cache.deployment() else {
        return Ok(());
    };

    let mut remove = Vec::new();
    for finalizer in obj.finalizers() {
        if finalizer != FINALIZER_REMOVE_CHILD_FINALIZERS {
            continue;
        }
        match remove_child_finalizers(kube, cache, namespace).await {
            Ok(Cleanup::Clear) => remove.push(finalizer.clone()),
            Ok(Cleanup::Pending) => {
                debug!(deployment = %name, "child finalizers removed, waiting for next observation")
            }
            Err(e) => debug!(deployment = %name, error = %e, "Not all child finalizers removed"),
        }
    }

    if remove.is_empty() {
        return Ok(());
    }
    remove_deployment_finalizers(kube, namespace, name, &remove).await
}

/// Remove the given tokens from the latest version of the owning object
async fn remove_deployment_finalizers(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
    remove: &[String],
) -> Result<(), Error> {
    let Some(latest) = kube.get_deployment(namespace, name).await? else {
        return Ok(());
    };
    let current = latest.finalizers();
    let remaining: Vec<String> = current
        .iter()
        .filter(|f| !remove.contains(f))
        .cloned()
        .collect();
    if remaining.len() == current.len() {
        return Ok(());
    }
    match kube
        .set_deployment_finalizers(namespace, name, remaining, latest.resource_version())
        .await
    {
        Ok(()) => {
            info!(deployment = %name, removed = ?remove, "removed deployment finalizers");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use arango_common::crd::DeploymentSpec;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    fn deployment(finalizers: Vec<&str>, deleting: bool) -> ArangoDeployment {
        let mut obj = ArangoDeployment::new(
            "cluster",
            DeploymentSpec {
                image: "arangodb:3.12".to_string(),
                ..Default::default()
            },
        );
        obj.metadata.namespace = Some("db".to_string());
        obj.metadata.resource_version = Some("42".to_string());
        obj.metadata.finalizers = Some(finalizers.into_iter().map(String::from).collect());
        if deleting {
            obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        obj
    }

    fn pod(name: &str, finalizers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                finalizers: Some(finalizers.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pvc(name: &str, finalizers: &[&str]) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                finalizers: Some(finalizers.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn ensure_adds_token_once() {
        let obj = deployment(vec!["other/finalizer"], false);
        let first = ensure_finalizers(&obj).unwrap();
        assert_eq!(
            first,
            vec![
                "other/finalizer".to_string(),
                FINALIZER_REMOVE_CHILD_FINALIZERS.to_string()
            ]
        );

        let mut applied = obj.clone();
        applied.metadata.finalizers = Some(first.clone());
        assert_eq!(ensure_finalizers(&applied), None);
        assert_eq!(applied.finalizers(), first.as_slice());
    }

    #[tokio::test]
    async fn add_finalizers_skips_write_when_present() {
        let mut kube = MockKubeClient::new();
        kube.expect_set_deployment_finalizers().never();
        let obj = deployment(vec![FINALIZER_REMOVE_CHILD_FINALIZERS], false);
        assert!(!add_finalizers(&kube, &obj).await.unwrap());
    }

    #[tokio::test]
    async fn add_finalizers_uses_resource_version() {
        let mut kube = MockKubeClient::new();
        kube.expect_set_deployment_finalizers()
            .withf(|ns, name, f, rv| {
                ns == "db"
                    && name == "cluster"
                    && f == &vec![FINALIZER_REMOVE_CHILD_FINALIZERS.to_string()]
                    && rv.as_deref() == Some("42")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let obj = deployment(vec![], false);
        assert!(add_finalizers(&kube, &obj).await.unwrap());
    }

    /// A child pod still carries finalizers: they are cleared but the owner
    /// keeps its token until a later snapshot shows the pod clean.
    #[tokio::test]
    async fn token_stays_while_child_pod_has_finalizers() {
        let obj = deployment(vec![FINALIZER_REMOVE_CHILD_FINALIZERS], true);
        let cache = Inspector::new(Some(obj.clone()))
            .with_pods(vec![pod("cluster-prmr-1", &["kubernetes.io/pvc-protection"])]);

        let mut kube = MockKubeClient::new();
        kube.expect_remove_pod_finalizers()
            .withf(|ns, name| ns == "db" && name == "cluster-prmr-1")
            .times(1)
            .returning(|_, _| Ok(()));
        kube.expect_get_deployment().never();
        kube.expect_set_deployment_finalizers().never();

        run_deployment_finalizers(&kube, &cache, "db", "cluster")
            .await
            .unwrap();

        // next cycle: the pod no longer has finalizers
        let cache = Inspector::new(Some(obj.clone())).with_pods(vec![pod("cluster-prmr-1", &[])]);
        let mut kube = MockKubeClient::new();
        kube.expect_remove_pod_finalizers().never();
        let latest = obj.clone();
        kube.expect_get_deployment()
            .returning(move |_, _| Ok(Some(latest.clone())));
        kube.expect_set_deployment_finalizers()
            .withf(|_, _, f, rv| f.is_empty() && rv.as_deref() == Some("42"))
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        run_deployment_finalizers(&kube, &cache, "db", "cluster")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failing_predicate_leaves_token_and_is_not_escalated() {
        let obj = deployment(vec![FINALIZER_REMOVE_CHILD_FINALIZERS], true);
        let cache =
            Inspector::new(Some(obj)).with_pvcs(vec![pvc("cluster-prmr-1", &["kubernetes.io/pvc-protection"])]);

        let mut kube = MockKubeClient::new();
        kube.expect_remove_pvc_finalizers()
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));
        kube.expect_get_deployment().never();
        kube.expect_set_deployment_finalizers().never();

        assert!(run_deployment_finalizers(&kube, &cache, "db", "cluster")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn conflict_on_owner_update_is_returned_for_next_cycle() {
        let obj = deployment(vec![FINALIZER_REMOVE_CHILD_FINALIZERS, "keep/me"], true);
        let cache = Inspector::new(Some(obj.clone()));

        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment()
            .times(1)
            .returning(move |_, _| Ok(Some(obj.clone())));
        kube.expect_set_deployment_finalizers()
            .withf(|_, _, f, _| f == &vec!["keep/me".to_string()])
            .times(1)
            .returning(|_, _, _, _| Err(Error::conflict(0, 1)));

        let err = run_deployment_finalizers(&kube, &cache, "db", "cluster")
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn foreign_finalizers_are_left_alone() {
        let obj = deployment(vec!["someone/else"], true);
        let cache = Inspector::new(Some(obj));
        let mut kube = MockKubeClient::new();
        kube.expect_get_deployment().never();
        kube.expect_set_deployment_finalizers().never();
        run_deployment_finalizers(&kube, &cache, "db", "cluster")
            .await
            .unwrap();
    }
}
