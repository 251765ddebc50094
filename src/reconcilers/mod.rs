//! Reconcilers for the PostgresCluster resource
//!
//! This module contains the business logic for reconciling a cluster:
//! - Finalizer handling and ordered teardown on deletion
//! - pgBackRest configuration synthesis and apply
//! - RBAC provisioning for instance pods
//! - Spec validation and status updates

pub mod apply;
pub mod cluster;
pub mod delete;
pub mod rbac;
