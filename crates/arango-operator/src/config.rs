//! Command line and environment configuration

use std::time::Duration;

use arango_common::timeouts::Timeouts;
use arango_deployment::{EngineConfig, Interval};
use clap::Parser;

/// ArangoDB operator - reconciles ArangoDeployment resources
#[derive(Parser, Debug, Clone)]
#[command(name = "arango-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the ArangoDeployment CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Install or update the CRD on startup
    #[arg(long, env = "ARANGO_INSTALL_CRD")]
    pub install_crd: bool,

    /// Namespace to watch; all namespaces if unset
    #[arg(long, env = "ARANGO_WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Name reported in events and used as field manager
    #[arg(long, env = "ARANGO_OPERATOR_NAME", default_value = "arango-deployment-operator")]
    pub operator_name: String,

    /// Shortest delay between two cycles of one deployment, in milliseconds
    #[arg(long, env = "ARANGO_MIN_INSPECTION_INTERVAL_MS", default_value_t = 250)]
    pub min_inspection_interval_ms: u64,

    /// Longest delay between two cycles of one deployment, in milliseconds
    #[arg(long, env = "ARANGO_MAX_INSPECTION_INTERVAL_MS", default_value_t = 10_000)]
    pub max_inspection_interval_ms: u64,

    /// Deadline for one Kubernetes API call, in seconds
    #[arg(long, env = "ARANGO_KUBERNETES_TIMEOUT_SECS", default_value_t = 2)]
    pub kubernetes_timeout_secs: u64,

    /// Deadline for one ArangoDB HTTP call, in seconds
    #[arg(long, env = "ARANGO_ARANGOD_TIMEOUT_SECS", default_value_t = 10)]
    pub arangod_timeout_secs: u64,

    /// Lower bound for the deadline of one reconciliation cycle, in seconds
    #[arg(long, env = "ARANGO_RECONCILIATION_TIMEOUT_SECS", default_value_t = 60)]
    pub reconciliation_timeout_secs: u64,
}

impl Cli {
    /// Operator-wide deadlines
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            kubernetes: Duration::from_secs(self.kubernetes_timeout_secs),
            arangod: Duration::from_secs(self.arangod_timeout_secs),
            reconciliation: Duration::from_secs(self.reconciliation_timeout_secs),
        }
    }

    /// Settings handed to every deployment engine
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            min_interval: Interval::new(Duration::from_millis(self.min_inspection_interval_ms)),
            max_interval: Interval::new(Duration::from_millis(self.max_inspection_interval_ms)),
            timeouts: self.timeouts(),
        }
    }
}
