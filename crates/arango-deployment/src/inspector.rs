//! Point-in-time view of the platform objects belonging to one deployment
//!
//! Refreshed once at the start of every cycle and never mutated afterwards;
//! every step in a cycle reads the same snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;

use arango_common::crd::ArangoDeployment;
use arango_common::{deployment_selector, Error};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Secret, Service};
use kube::ResourceExt;
use tracing::debug;

use crate::client::KubeClient;

/// Immutable snapshot of a deployment and its children
#[derive(Clone, Debug, Default)]
pub struct Inspector {
    deployment: Option<ArangoDeployment>,
    pods: BTreeMap<String, Pod>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    secrets: BTreeMap<String, Secret>,
    services: BTreeMap<String, Service>,
    nodes: Vec<Node>,
}

fn by_name<K: ResourceExt>(items: impl IntoIterator<Item = K>) -> BTreeMap<String, K> {
    items.into_iter().map(|k| (k.name_any(), k)).collect()
}

impl Inspector {
    /// Snapshot for the given owning object (absent if deleted)
    pub fn new(deployment: Option<ArangoDeployment>) -> Self {
        Self {
            deployment,
            ..Default::default()
        }
    }

    /// Replace the pods in the snapshot
    pub fn with_pods(mut self, pods: impl IntoIterator<Item = Pod>) -> Self {
        self.pods = by_name(pods);
        self
    }

    /// Replace the volume claims in the snapshot
    pub fn with_pvcs(mut self, pvcs: impl IntoIterator<Item = PersistentVolumeClaim>) -> Self {
        self.pvcs = by_name(pvcs);
        self
    }

    /// Replace the secrets in the snapshot
    pub fn with_secrets(mut self, secrets: impl IntoIterator<Item = Secret>) -> Self {
        self.secrets = by_name(secrets);
        self
    }

    /// Replace the services in the snapshot
    pub fn with_services(mut self, services: impl IntoIterator<Item = Service>) -> Self {
        self.services = by_name(services);
        self
    }

    /// Replace the nodes in the snapshot
    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    /// The owning ArangoDeployment, `None` if it is gone
    pub fn deployment(&self) -> Option<&ArangoDeployment> {
        self.deployment.as_ref()
    }

    /// Visit every pod accepted by `filter`, stopping at the first error
    pub fn iterate_pods<F, V>(&self, filter: F, mut visitor: V) -> Result<(), Error>
    where
        F: Fn(&Pod) -> bool,
        V: FnMut(&Pod) -> Result<(), Error>,
    {
        self.pods.values().filter(|p| filter(p)).try_for_each(|p| visitor(p))
    }

    /// Pod by name
    pub fn pod(&self, name: &str) -> Option<&Pod> {
        self.pods.get(name)
    }

    /// All pods
    pub fn pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.values()
    }

    /// Volume claim by name
    pub fn pvc(&self, name: &str) -> Option<&PersistentVolumeClaim> {
        self.pvcs.get(name)
    }

    /// All volume claims
    pub fn pvcs(&self) -> impl Iterator<Item = &PersistentVolumeClaim> {
        self.pvcs.values()
    }

    /// Secret by name
    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.secrets.get(name)
    }

    /// Service by name
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Cluster nodes
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Source of per-cycle snapshots
#[async_trait]
pub trait ClusterCache: Send + Sync {
    /// Build a fresh snapshot for one deployment
    async fn refresh(&self, namespace: &str, name: &str) -> Result<Arc<Inspector>, Error>;
}

/// Snapshot source that lists everything straight from the API server
pub struct KubeClusterCache {
    kube: Arc<dyn KubeClient>,
}

impl KubeClusterCache {
    /// Create a cache over the given client
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl ClusterCache for KubeClusterCache {
    async fn refresh(&self, namespace: &str, name: &str) -> Result<Arc<Inspector>, Error> {
        let selector = deployment_selector(name);
        let (deployment, pods, pvcs, secrets, services) = tokio::try_join!(
            self.kube.get_deployment(namespace, name),
            self.kube.list_pods(namespace, &selector),
            self.kube.list_pvcs(namespace, &selector),
            self.kube.list_secrets(namespace),
            self.kube.list_services(namespace, &selector),
        )?;

        // Node access is optional RBAC; without it the cycle deadline uses its floor
        let nodes = match self.kube.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                debug!(error = %e, "unable to list nodes");
                Vec::new()
            }
        };

        Ok(Arc::new(
            Inspector::new(deployment)
                .with_pods(pods)
                .with_pvcs(pvcs)
                .with_secrets(secrets)
                .with_services(services)
                .with_nodes(nodes),
        ))
    }
}
