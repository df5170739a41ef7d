//! Error types for the ArangoDB operator
//!
//! Errors are structured with fields to aid debugging in production.
//! The reconciliation pipeline classifies errors with [`Error::is_reconcile`]
//! and [`Error::is_conflict`] to decide between a quiet retry and a
//! user-visible failure event.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for ArangoDeployment specs
    #[error("validation error for {deployment}: {message}")]
    Validation {
        /// Name of the deployment with invalid configuration
        deployment: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.agents.count")
        field: Option<String>,
    },

    /// Status write rejected because the caller observed a stale version
    #[error("status conflict: observed version {observed}, current version {current}")]
    Conflict {
        /// Version the caller read before mutating
        observed: u64,
        /// Version held by the store at write time
        current: u64,
    },

    /// Status was accepted in memory but could not be persisted
    #[error("failed to persist status of {deployment}: {message}")]
    Persist {
        /// Name of the deployment whose status was written
        deployment: String,
        /// Description of what failed
        message: String,
    },

    /// Expected transient condition; resolves on the next observation
    #[error("reconcile needed: {message}")]
    ReconcileNeeded {
        /// What is not yet in the expected state
        message: String,
    },

    /// A bounded retry loop gave up
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Name of the retried operation
        operation: String,
        /// Number of attempts made
        attempts: u32,
        /// Display of the last error seen
        last_error: String,
    },

    /// An operation exceeded its deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Name of the operation
        operation: String,
        /// Deadline that elapsed
        after: Duration,
    },

    /// HTTP call to a database server failed
    #[error("http error [{endpoint}]: {message}")]
    Http {
        /// Endpoint that was called
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A pipeline step failed; the context names the step
    #[error("{context}: {source}")]
    Step {
        /// Human readable step failure summary (used as event message prefix)
        context: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "pipeline", "worker")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            deployment: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with deployment context and field path
    pub fn validation_for_field(
        deployment: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            deployment: deployment.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a version conflict error
    pub fn conflict(observed: u64, current: u64) -> Self {
        Self::Conflict { observed, current }
    }

    /// Create a persistence error for a deployment
    pub fn persist(deployment: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Persist {
            deployment: deployment.into(),
            message: msg.into(),
        }
    }

    /// Create a reconcile-needed error
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::ReconcileNeeded {
            message: msg.into(),
        }
    }

    /// Create an exhausted-retries error
    pub fn retries_exhausted(
        operation: impl Into<String>,
        attempts: u32,
        last_error: impl std::fmt::Display,
    ) -> Self {
        Self::RetriesExhausted {
            operation: operation.into(),
            attempts,
            last_error: last_error.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an HTTP error
    pub fn http(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with a step failure summary
    pub fn in_step(self, context: impl Into<String>) -> Self {
        Self::Step {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through step wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the pipeline should retry quietly instead of reporting a failure
    pub fn is_reconcile(&self) -> bool {
        matches!(self.root(), Error::ReconcileNeeded { .. })
    }

    /// Whether this is an optimistic-concurrency conflict
    ///
    /// Covers both the status store version check and HTTP 409 from the API
    /// server on resourceVersion-guarded updates.
    pub fn is_conflict(&self) -> bool {
        match self.root() {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Whether the API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.root(),
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404
        )
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors require a spec fix. Kubernetes
    /// errors are retryable unless they are 4xx responses.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Conflict { .. } => true,
            Error::Persist { .. } => true,
            Error::ReconcileNeeded { .. } => true,
            Error::RetriesExhausted { .. } => false,
            Error::Timeout { .. } => true,
            Error::Http { .. } => true,
            Error::Serialization { .. } => false,
            Error::Step { source, .. } => source.is_retryable(),
            Error::Internal { .. } => true,
        }
    }

    /// Get the deployment name if this error is associated with one
    pub fn deployment(&self) -> Option<&str> {
        match self {
            Error::Validation { deployment, .. } => Some(deployment),
            Error::Persist { deployment, .. } => Some(deployment),
            Error::Step { source, .. } => source.deployment(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "boom".to_string(),
                reason: "Test".to_string(),
                code,
            }),
        }
    }

    // ==========================================================================
    // Story Tests: How the pipeline reads errors
    // ==========================================================================

    /// Story: a status write raced with another writer
    ///
    /// The loser sees a conflict that names both versions, and conflicts are
    /// never user-facing failures.
    #[test]
    fn story_conflicting_status_writes_are_retried_quietly() {
        let err = Error::conflict(3, 4);
        assert!(err.to_string().contains("observed version 3"));
        assert!(err.to_string().contains("current version 4"));
        assert!(err.is_conflict());
        assert!(err.is_retryable());

        // API server 409 on a resourceVersion-guarded update is the same class
        assert!(api_error(409).is_conflict());
        assert!(!api_error(500).is_conflict());
    }

    /// Story: a step wraps its failure with a summary for the event message
    #[test]
    fn story_step_context_prefixes_the_event_message() {
        let err = Error::internal("secret jwt changed").in_step("Secret hash validation failed");
        assert!(err
            .to_string()
            .starts_with("Secret hash validation failed: "));
        assert!(matches!(err.root(), Error::Internal { .. }));
    }

    /// Story: reconcile-needed is recognised through step wrappers
    #[test]
    fn story_reconcile_needed_is_not_a_failure() {
        let err = Error::reconcile("member pod not yet scheduled").in_step("Pod inspection failed");
        assert!(err.is_reconcile());
        assert!(!Error::internal("x").is_reconcile());
    }

    /// Story: not found is only reported for 404 responses
    #[test]
    fn story_not_found_detection() {
        assert!(api_error(404).is_not_found());
        assert!(api_error(404).in_step("Probe cleanup failed").is_not_found());
        assert!(!api_error(403).is_not_found());
        assert!(!api_error(403).is_retryable());
        assert!(api_error(503).is_retryable());
    }

    #[test]
    fn exhausted_retries_are_terminal() {
        let err = Error::retries_exhausted("persist status", 5, "connection reset");
        assert_eq!(
            err.to_string(),
            "persist status failed after 5 attempts: connection reset"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn deployment_context_is_exposed() {
        let err = Error::validation_for_field("db", "spec.agents.count", "must be odd");
        assert_eq!(err.deployment(), Some("db"));
        let err = Error::persist("db", "409").in_step("status");
        assert_eq!(err.deployment(), Some("db"));
        assert_eq!(Error::timeout("list pods", Duration::from_secs(2)).deployment(), None);
    }
}
