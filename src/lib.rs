//! Postgres Cluster Kubernetes Operator
//!
//! This operator manages clustered PostgreSQL in Kubernetes using a
//! PostgresCluster Custom Resource Definition: it provisions instance RBAC,
//! synthesizes pgBackRest backup configuration, and handles finalizer-gated
//! teardown on deletion.

pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod pgbackrest;
pub mod reconcilers;

pub use error::{Error, Result};
