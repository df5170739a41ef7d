//! Global timeout policy
//!
//! Every platform call and every database call is issued with a deadline
//! taken from here. The whole reconciliation cycle gets its own deadline
//! that scales with the number of nodes in the cluster.

use std::future::Future;
use std::time::Duration;

use crate::Error;

/// Deadline per reconciliation cycle, per node
pub const CYCLE_TIMEOUT_PER_NODE: Duration = Duration::from_secs(20);
/// Minimum deadline per reconciliation cycle
pub const MIN_CYCLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Operator-wide timeouts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for a single Kubernetes API call
    pub kubernetes: Duration,
    /// Deadline for a single ArangoDB HTTP call
    pub arangod: Duration,
    /// Lower bound for a whole reconciliation cycle
    pub reconciliation: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            kubernetes: Duration::from_secs(2),
            arangod: Duration::from_secs(10),
            reconciliation: MIN_CYCLE_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Deadline for one cycle on a cluster with `node_count` nodes
    pub fn cycle(&self, node_count: usize) -> Duration {
        let scaled = CYCLE_TIMEOUT_PER_NODE.saturating_mul(node_count as u32);
        scaled.max(self.reconciliation).max(MIN_CYCLE_TIMEOUT)
    }
}

/// Run `fut` under a deadline, mapping expiry to [`Error::Timeout`]
pub async fn with_timeout<T, F>(operation: &str, after: Duration, fut: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(operation, after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 60)]
    #[case(1, 60)]
    #[case(3, 60)]
    #[case(4, 80)]
    #[case(10, 200)]
    fn cycle_timeout_scales_with_nodes(#[case] nodes: usize, #[case] secs: u64) {
        assert_eq!(Timeouts::default().cycle(nodes), Duration::from_secs(secs));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_is_a_timeout_error() {
        let result: Result<(), Error> = with_timeout("slow call", Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let result = with_timeout("fast call", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.ok(), Some(7));
    }
}
