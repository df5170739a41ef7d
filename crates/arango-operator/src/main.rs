//! ArangoDB operator - manages ArangoDeployment resources

mod config;
mod operator;
mod registry;

use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;

use arango_common::crd::ArangoDeployment;
use arango_common::telemetry::{init_telemetry, TelemetryConfig};
use arango_common::FIELD_MANAGER;

use crate::config::Cli;
use crate::operator::Operator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ArangoDeployment::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: cli.operator_name.clone(),
        ..Default::default()
    })?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if cli.install_crd {
        ensure_crd_installed(&client).await?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for shutdown signal");
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    Operator::new(client, &cli, shutdown).run().await;
    tracing::info!("operator stopped");
    Ok(())
}

/// Install or update the ArangoDeployment CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing ArangoDeployment CRD...");
    crds.patch(
        "arangodeployments.database.arangodb.com",
        &params,
        &Patch::Apply(&ArangoDeployment::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install ArangoDeployment CRD: {}", e))?;
    Ok(())
}
