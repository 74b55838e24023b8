//! Node maintenance operator.
//!
//! A `NodeMaintenance` request names a node. The controller taints and cordons
//! that node, evicts its pods while honoring disruption budgets and records
//! progress in the request's status. Deleting the request puts the node back
//! into service.

pub mod config;
pub mod controller;
pub mod crd;
pub mod drain;
pub mod error;
pub mod metrics;
pub mod pod_watcher;
pub mod status;
pub mod store;
pub mod taints;

pub use config::Config;
pub use controller::{error_policy, reconcile, reconcile_request, run, Context, FINALIZER_NAME};
pub use crd::{MaintenancePhase, NodeMaintenance, NodeMaintenanceSpec, NodeMaintenanceStatus};
pub use error::{Error, EvictionError, Result};
pub use store::{ClusterApi, KubeCluster, PodEvictor};
