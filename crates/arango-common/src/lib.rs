//! Common types for the ArangoDB operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;
pub mod timeouts;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer on ArangoDeployment objects that guards child finalizer cleanup
pub const FINALIZER_REMOVE_CHILD_FINALIZERS: &str =
    "database.arangodb.com/remove-child-finalizers";

/// Annotation that pauses reconciliation while set to "true"
pub const ANNOTATION_MAINTENANCE: &str = "deployment.arangodb.com/maintenance";

/// Annotation requesting the current plan be discarded
pub const ANNOTATION_PLAN_CLEAN: &str = "deployment.arangodb.com/plan-clean";

/// Label naming the owning deployment on every child resource
pub const LABEL_DEPLOYMENT: &str = "arango_deployment";

/// Label naming the role of a child pod
pub const LABEL_ROLE: &str = "role";

/// Label marking resources as managed by this operator
pub const LABEL_APP: &str = "app";

/// Value of [`LABEL_APP`] on managed resources
pub const LABEL_APP_VALUE: &str = "arangodb";

/// Role label value of image discovery probe pods
pub const ROLE_IMAGE_DISCOVERY: &str = "id";

/// Port the ArangoDB server listens on
pub const ARANGOD_PORT: u16 = 8529;

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "arango-operator";

/// Label selector for children of a deployment
pub fn deployment_selector(name: &str) -> String {
    format!("{}={},{}={}", LABEL_APP, LABEL_APP_VALUE, LABEL_DEPLOYMENT, name)
}
