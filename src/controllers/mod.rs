//! Kubernetes controllers for the Postgres Cluster Operator
//!
//! This module contains the controller implementation that watches
//! PostgresCluster resources and triggers reconciliation.

mod cluster_controller;

pub use cluster_controller::run as run_cluster_controller;

use kube::Client;

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}
