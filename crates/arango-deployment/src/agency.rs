//! Cluster agency access
//!
//! The agency is the raft-backed configuration store of an ArangoDB cluster.
//! The engine keeps a small cache of it per cycle (commit index and the
//! supervision maintenance expiry) and can re-assert the maintenance lease.
//! Every call here is best effort from the pipeline's point of view.

use std::time::Duration;

use arango_common::crd::Condition;
use arango_common::{Error, ARANGOD_PORT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Lifetime of a maintenance lease as granted by the agency
pub const MAINTENANCE_LEASE: Duration = Duration::from_secs(60 * 60);

const MAINTENANCE_KEY: &str = "/arango/Supervision/Maintenance";

/// Agency state observed in one cycle
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgencySnapshot {
    /// Raft commit index of the agency leader
    pub index: u64,
    /// Expiry of the supervision maintenance lease, if set
    pub maintenance_until: Option<DateTime<Utc>>,
}

/// Access to the agency of one deployment
#[async_trait]
pub trait AgencyClient: Send + Sync {
    /// Read the current agency state
    async fn refresh(&self, namespace: &str, name: &str) -> Result<AgencySnapshot, Error>;

    /// Switch cluster supervision maintenance on or off
    async fn set_maintenance(&self, namespace: &str, name: &str, enabled: bool)
        -> Result<(), Error>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgencyConfig {
    commit_index: u64,
}

/// Agency client over the in-cluster services of a deployment
pub struct HttpAgencyClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpAgencyClient {
    /// Create a client with a per-request deadline
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    fn agents_url(namespace: &str, name: &str, path: &str) -> String {
        format!("http://{name}-agent.{namespace}.svc:{ARANGOD_PORT}{path}")
    }

    fn coordinators_url(namespace: &str, name: &str, path: &str) -> String {
        format!("http://{name}.{namespace}.svc:{ARANGOD_PORT}{path}")
    }

    async fn send(&self, url: &str, request: reqwest::RequestBuilder) -> Result<reqwest::Response, Error> {
        request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::http(url, e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::http(url, e.to_string()))
    }
}

/// Extract the maintenance expiry from an agency read response
fn maintenance_from_read(body: &Value) -> Option<DateTime<Utc>> {
    let value = MAINTENANCE_KEY
        .trim_start_matches('/')
        .split('/')
        .try_fold(body.get(0)?, |v, key| v.get(key))?;
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl AgencyClient for HttpAgencyClient {
    async fn refresh(&self, namespace: &str, name: &str) -> Result<AgencySnapshot, Error> {
        let config_url = Self::agents_url(namespace, name, "/_api/agency/config");
        let config: AgencyConfig = self
            .send(&config_url, self.http.get(&config_url))
            .await?
            .json()
            .await
            .map_err(|e| Error::http(&config_url, e.to_string()))?;

        let read_url = Self::agents_url(namespace, name, "/_api/agency/read");
        let body: Value = self
            .send(
                &read_url,
                self.http.post(&read_url).json(&[[MAINTENANCE_KEY]]),
            )
            .await?
            .json()
            .await
            .map_err(|e| Error::http(&read_url, e.to_string()))?;

        Ok(AgencySnapshot {
            index: config.commit_index,
            maintenance_until: maintenance_from_read(&body),
        })
    }

    async fn set_maintenance(
        &self,
        namespace: &str,
        name: &str,
        enabled: bool,
    ) -> Result<(), Error> {
        let url = Self::coordinators_url(namespace, name, "/_admin/cluster/maintenance");
        let mode = if enabled { "on" } else { "off" };
        self.send(&url, self.http.put(&url).json(&mode)).await?;
        Ok(())
    }
}

/// Whether an active maintenance lease has to be re-asserted
///
/// Never due without a fresh agency snapshot. With a known agency expiry
/// the lease is refreshed once less than `1h - grace` remains. Without one,
/// the condition's last update time is used: older than `grace` means due.
pub fn maintenance_refresh_due(
    condition: Option<&Condition>,
    snapshot: Option<&AgencySnapshot>,
    grace: Duration,
    now: DateTime<Utc>,
) -> bool {
    let Some(condition) = condition.filter(|c| c.is_true()) else {
        return false;
    };
    let Some(snapshot) = snapshot else {
        return false;
    };
    let grace = chrono::Duration::from_std(grace).unwrap_or_default();
    match snapshot.maintenance_until {
        Some(until) => {
            let lease = chrono::Duration::from_std(MAINTENANCE_LEASE).unwrap_or_default();
            until - now < lease - grace
        }
        None => now - condition.last_update_time > grace,
    }
}
