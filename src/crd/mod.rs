//! Custom Resource Definitions for the Postgres Cluster Operator

mod postgres_cluster;

pub use postgres_cluster::*;

use kube::CustomResourceExt;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&PostgresCluster::crd()).unwrap()]
}
