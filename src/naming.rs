//! Names, labels, and selectors for resources managed by the operator.
//!
//! Everything the operator writes is named and labeled here so that the
//! reconcilers agree on object identity and teardown selectors.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API group of the PostgresCluster resource
pub const GROUP: &str = "postgres.cluster-operator.io";

/// The finalizer token this operator owns on PostgresCluster resources.
/// Other controllers may hold their own tokens on the same list.
pub const FINALIZER: &str = "postgres.cluster-operator.io/finalizer";

/// Label identifying the cluster a resource belongs to
pub const LABEL_CLUSTER: &str = "postgres.cluster-operator.io/cluster";

/// Label present on Postgres instance workloads
pub const LABEL_INSTANCE: &str = "postgres.cluster-operator.io/instance";

/// Label present on Patroni coordination artifacts
pub const LABEL_PATRONI: &str = "postgres.cluster-operator.io/patroni";

/// Label present on all pgBackRest resources
pub const LABEL_PGBACKREST: &str = "postgres.cluster-operator.io/pgbackrest";

/// Label present on pgBackRest configuration resources
pub const LABEL_PGBACKREST_CONFIG: &str = "postgres.cluster-operator.io/pgbackrest-config";

/// `namespace/name` key for log and error context
pub fn cluster_key(cluster: &PostgresCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Merge metadata maps left to right. Later sources win on key collision,
/// so callers list cluster-level metadata before subsystem overrides.
pub fn merge(sources: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for source in sources {
        for (k, v) in source.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// ObjectMeta shared by the instance ServiceAccount, Role, and RoleBinding
pub fn cluster_instance_rbac(cluster: &PostgresCluster) -> ObjectMeta {
    ObjectMeta {
        namespace: cluster.namespace(),
        name: Some(format!("{}-instance", cluster.name_any())),
        ..Default::default()
    }
}

/// ObjectMeta of the ConfigMap carrying the generated pgBackRest configuration
pub fn pgbackrest_configmap(cluster: &PostgresCluster) -> ObjectMeta {
    ObjectMeta {
        namespace: cluster.namespace(),
        name: Some(format!("{}-pgbackrest-config", cluster.name_any())),
        ..Default::default()
    }
}

/// Name of the headless service governing cluster pods
pub fn cluster_pod_service(cluster: &PostgresCluster) -> String {
    format!("{}-pods", cluster.name_any())
}

/// Name of the dedicated repository host for the cluster
pub fn repo_host_name(cluster: &PostgresCluster) -> String {
    format!("{}-repo-host", cluster.name_any())
}

/// Label selector matching the cluster's instance StatefulSets
pub fn cluster_instances_selector(cluster: &PostgresCluster) -> String {
    format!("{}={},{}", LABEL_CLUSTER, cluster.name_any(), LABEL_INSTANCE)
}

/// Label selector matching the cluster's Patroni coordination artifacts
pub fn patroni_artifacts_selector(cluster: &PostgresCluster) -> String {
    format!("{}={},{}", LABEL_CLUSTER, cluster.name_any(), LABEL_PATRONI)
}

/// The DNS domain of the Kubernetes cluster, used when composing pod FQDNs.
/// Defaults to `cluster.local` when not configured on the operator.
pub fn kubernetes_cluster_domain() -> String {
    std::env::var("KUBERNETES_CLUSTER_DOMAIN").unwrap_or_else(|_| "cluster.local".to_string())
}
