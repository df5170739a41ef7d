//! Platform object API used by the engine
//!
//! Every call is bounded by the Kubernetes deadline from [`Timeouts`]. Not
//! found is surfaced as an error for which [`Error::is_not_found`] holds,
//! except for `get_*` calls which return `Ok(None)`.

use std::time::Duration;

use arango_common::crd::{ArangoDeployment, DeploymentStatus};
use arango_common::timeouts::with_timeout;
use arango_common::{Error, FIELD_MANAGER};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Trait abstracting the Kubernetes API for the reconciliation engine
///
/// Allows the pipeline to be driven against mocks and in-memory fakes in
/// tests while using the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get an ArangoDeployment, `None` if it does not exist
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ArangoDeployment>, Error>;

    /// Merge-patch the status subresource of an ArangoDeployment
    async fn patch_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DeploymentStatus,
    ) -> Result<(), Error>;

    /// Set the finalizer list of an ArangoDeployment
    ///
    /// With a resource version the write only succeeds if the object has not
    /// changed since it was read (HTTP 409 otherwise).
    async fn set_deployment_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Remove an annotation from an ArangoDeployment
    async fn remove_deployment_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), Error>;

    /// List pods matching a label selector
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Clear all finalizers of a pod via get, mutate, replace
    ///
    /// A pod that no longer exists is treated as done.
    async fn remove_pod_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List volume claims matching a label selector
    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Delete a volume claim
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Clear all finalizers of a volume claim via get, mutate, replace
    async fn remove_pvc_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List all secrets in a namespace
    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, Error>;

    /// Server-side apply a secret
    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// List services matching a label selector
    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error>;

    /// Server-side apply a service
    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Server-side apply a pod disruption budget
    async fn apply_pdb(&self, namespace: &str, pdb: &PodDisruptionBudget) -> Result<(), Error>;

    /// List cluster nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    timeout: Duration,
}

impl KubeClientImpl {
    /// Create a client that bounds each call by `timeout`
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn list<K>(&self, api: Api<K>, selector: &str, op: &str) -> Result<Vec<K>, Error>
    where
        K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let lp = if selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(selector)
        };
        with_timeout(op, self.timeout, async {
            Ok(api.list(&lp).await?.items)
        })
        .await
    }

    async fn apply<K>(&self, api: Api<K>, obj: &K, op: &str) -> Result<(), Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::internal_with_context(op, "object has no name"))?;
        with_timeout(op, self.timeout, async {
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(obj),
            )
            .await?;
            Ok(())
        })
        .await
    }

    async fn delete<K>(&self, api: Api<K>, name: &str, op: &str) -> Result<(), Error>
    where
        K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    {
        with_timeout(op, self.timeout, async {
            api.delete(name, &DeleteParams::default()).await?;
            Ok(())
        })
        .await
    }

    async fn clear_finalizers<K>(&self, api: Api<K>, name: &str, op: &str) -> Result<(), Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
    {
        with_timeout(op, self.timeout, async {
            let Some(mut obj) = api.get_opt(name).await? else {
                return Ok(());
            };
            if obj.finalizers().is_empty() {
                return Ok(());
            }
            obj.meta_mut().finalizers = None;
            match api.replace(name, &PostParams::default(), &obj).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ArangoDeployment>, Error> {
        let api: Api<ArangoDeployment> = self.namespaced(namespace);
        with_timeout("get deployment", self.timeout, async {
            Ok(api.get_opt(name).await?)
        })
        .await
    }

    async fn patch_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DeploymentStatus,
    ) -> Result<(), Error> {
        let api: Api<ArangoDeployment> = self.namespaced(namespace);
        let patch = serde_json::json!({ "status": status });
        with_timeout("patch deployment status", self.timeout, async {
            api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await
    }

    async fn set_deployment_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let api: Api<ArangoDeployment> = self.namespaced(namespace);
        let mut metadata = serde_json::json!({ "finalizers": finalizers });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = serde_json::Value::String(rv);
        }
        let patch = serde_json::json!({ "metadata": metadata });
        debug!(deployment = %name, "updating deployment finalizers");
        with_timeout("set deployment finalizers", self.timeout, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await
    }

    async fn remove_deployment_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), Error> {
        let api: Api<ArangoDeployment> = self.namespaced(namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": { key: null } } });
        with_timeout("remove deployment annotation", self.timeout, async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        self.list(self.namespaced(namespace), selector, "list pods")
            .await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = self.namespaced(namespace);
        with_timeout("create pod", self.timeout, async {
            api.create(&PostParams::default(), pod).await?;
            Ok(())
        })
        .await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete(self.namespaced::<Pod>(namespace), name, "delete pod")
            .await
    }

    async fn remove_pod_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.clear_finalizers(self.namespaced::<Pod>(namespace), name, "remove pod finalizers")
            .await
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        self.list(self.namespaced(namespace), selector, "list pvcs")
            .await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.delete(
            self.namespaced::<PersistentVolumeClaim>(namespace),
            name,
            "delete pvc",
        )
        .await
    }

    async fn remove_pvc_finalizers(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.clear_finalizers(
            self.namespaced::<PersistentVolumeClaim>(namespace),
            name,
            "remove pvc finalizers",
        )
        .await
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>, Error> {
        self.list(self.namespaced(namespace), "", "list secrets")
            .await
    }

    async fn apply_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        self.apply(self.namespaced(namespace), secret, "apply secret")
            .await
    }

    async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>, Error> {
        self.list(self.namespaced(namespace), selector, "list services")
            .await
    }

    async fn apply_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        self.apply(self.namespaced(namespace), service, "apply service")
            .await
    }

    async fn apply_pdb(&self, namespace: &str, pdb: &PodDisruptionBudget) -> Result<(), Error> {
        self.apply(self.namespaced(namespace), pdb, "apply pod disruption budget")
            .await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        self.list(Api::all(self.client.clone()), "", "list nodes")
            .await
    }
}
