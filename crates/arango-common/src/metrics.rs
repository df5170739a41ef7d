//! Metrics registry for ArangoDB operator observability
//!
//! Pure observability: nothing here feeds back into control flow.
//!
//! - Reconciliation cycles (duration, outcome)
//! - Agency cache refresh (fetches, errors, raft index)
//! - Per-deployment member and condition state
//! - Deployment registry size

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

/// Global meter for operator metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("arango-operator"));

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Gauge of the last reconciliation cycle duration
///
/// Labels:
/// - `namespace`, `deployment`
pub static INSPECT_DEPLOYMENT_DURATION: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("arangodb_operator_deployment_inspect_duration_seconds")
        .with_description("Duration of the last deployment inspection in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation cycles by outcome
///
/// Labels:
/// - `namespace`, `deployment`
/// - `outcome`: clean, retry, failed
pub static INSPECT_DEPLOYMENT_CYCLES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arangodb_operator_deployment_inspect_cycles_total")
        .with_description("Total number of deployment inspection cycles by outcome")
        .with_unit("{cycles}")
        .build()
});

/// Counter of status re-persists after the stored status drifted
pub static STATUS_RESTORES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arangodb_operator_deployment_status_restores_total")
        .with_description("Total number of times the deployment status was restored")
        .with_unit("{restores}")
        .build()
});

// ============================================================================
// Agency Metrics
// ============================================================================

/// Counter of agency cache refreshes
pub static AGENCY_FETCHES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arangodb_operator_deployment_agency_fetches_total")
        .with_description("Total number of agency cache refreshes")
        .with_unit("{fetches}")
        .build()
});

/// Counter of failed agency cache refreshes
pub static AGENCY_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("arangodb_operator_deployment_agency_errors_total")
        .with_description("Total number of failed agency cache refreshes")
        .with_unit("{errors}")
        .build()
});

/// Gauge of the last observed agency raft index
pub static AGENCY_INDEX: Lazy<Gauge<u64>> = Lazy::new(|| {
    METER
        .u64_gauge("arangodb_operator_deployment_agency_index")
        .with_description("Last observed agency raft commit index")
        .build()
});

// ============================================================================
// Deployment State Metrics
// ============================================================================

/// Gauge of members per group
///
/// Labels:
/// - `namespace`, `deployment`, `group`
pub static DEPLOYMENT_MEMBERS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("arangodb_operator_deployment_members")
        .with_description("Number of members per server group")
        .with_unit("{members}")
        .build()
});

/// Gauge of deployment conditions (1 = True, 0 = otherwise)
///
/// Labels:
/// - `namespace`, `deployment`, `condition`
pub static DEPLOYMENT_CONDITION: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("arangodb_operator_deployment_condition")
        .with_description("Deployment condition state")
        .build()
});

/// Gauge of deployments managed by this operator instance
pub static DEPLOYMENTS_MANAGED: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("arangodb_operator_deployments")
        .with_description("Number of deployments with a running worker")
        .with_unit("{deployments}")
        .build()
});

/// Common labels for per-deployment series
pub fn deployment_labels(namespace: &str, name: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new("namespace", namespace.to_string()),
        KeyValue::new("deployment", name.to_string()),
    ]
}
