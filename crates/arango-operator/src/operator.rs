//! Watch loop starting and stopping deployment workers

use std::pin::pin;
use std::sync::Arc;

use arango_common::crd::ArangoDeployment;
use arango_common::events::KubeEventPublisher;
use arango_deployment::{worker, Collaborators, Deployment, EngineConfig, KubeClientImpl};
use futures::StreamExt;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Cli;
use crate::registry::{key, DeploymentRegistry};

/// Watcher timeout (seconds); must stay below the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Owns the registry and reacts to ArangoDeployment events
pub struct Operator {
    client: Client,
    namespace: Option<String>,
    deps: Arc<Collaborators>,
    config: EngineConfig,
    registry: DeploymentRegistry,
    shutdown: CancellationToken,
}

impl Operator {
    /// Wire the production collaborators from the command line
    pub fn new(client: Client, cli: &Cli, shutdown: CancellationToken) -> Self {
        let config = cli.engine_config();
        let kube = Arc::new(KubeClientImpl::new(client.clone(), config.timeouts.kubernetes));
        let events = Arc::new(KubeEventPublisher::new(client.clone(), &cli.operator_name));
        Self {
            deps: Arc::new(Collaborators::kubernetes(kube, events, config.timeouts)),
            namespace: cli.namespace.clone(),
            client,
            config,
            registry: DeploymentRegistry::default(),
            shutdown,
        }
    }

    /// Run until shutdown, then wait for every worker to exit
    pub async fn run(self) {
        let api: Api<ArangoDeployment> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        info!(namespace = ?self.namespace, "watching ArangoDeployments");

        let mut events = pin!(watcher::watcher(
            api,
            watcher::Config::default().timeout(WATCH_TIMEOUT_SECS)
        )
        .default_backoff());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => warn!(error = %e, "ArangoDeployment watch error"),
                    None => break,
                },
            }
        }

        info!(deployments = ?self.registry.keys(), "shutting down");
        let workers = self.registry.drain();
        info!(count = workers.len(), "waiting for deployment workers");
        for handle in workers {
            handle.join().await;
        }
    }

    fn handle(&self, event: Event<ArangoDeployment>) {
        match event {
            Event::Apply(obj) | Event::InitApply(obj) => self.apply(obj),
            Event::Delete(obj) => self.delete(&obj),
            Event::Init | Event::InitDone => {}
        }
    }

    fn apply(&self, obj: ArangoDeployment) {
        let key = key(&obj.namespace_or_default(), &obj.name_any());
        if self.registry.notify(&key) {
            debug!(deployment = %key, "notified deployment worker");
            return;
        }
        info!(deployment = %key, "starting deployment worker");
        let deployment = Deployment::with_kube_persister(obj, self.deps.clone(), self.config);
        let handle = worker::spawn(deployment, self.shutdown.child_token());
        self.registry.add(key, handle);
        debug!(managed = self.registry.len(), "deployment worker registered");
    }

    fn delete(&self, obj: &ArangoDeployment) {
        let key = key(&obj.namespace_or_default(), &obj.name_any());
        if self.registry.remove(&key).is_some() {
            info!(deployment = %key, "stopped deployment worker");
        }
    }
}
