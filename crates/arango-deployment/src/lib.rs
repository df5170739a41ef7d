//! Reconciliation engine for ArangoDeployment resources
//!
//! One [`Deployment`] engine per managed object, driven by a worker from
//! [`worker::spawn`]. Each cycle refreshes an [`Inspector`] snapshot, runs the
//! ordered [`pipeline`] steps against it and returns the delay before the
//! next cycle.

#![deny(missing_docs)]

pub mod agency;
pub mod client;
pub mod deployment;
pub mod finalizers;
pub mod images;
pub mod inspector;
pub mod interval;
pub mod pipeline;
pub mod plan;
pub mod resilience;
pub mod resources;
pub mod status_store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use client::{KubeClient, KubeClientImpl};
pub use deployment::{Collaborators, Deployment, EngineConfig};
pub use inspector::{ClusterCache, Inspector, KubeClusterCache};
pub use interval::{CycleOutcome, InspectionScheduler, Interval};
pub use status_store::{KubeStatusPersister, StatusPersister, StatusStore};
pub use worker::DeploymentHandle;
