//! Server-side apply and ownership helpers shared by the reconcilers

use kube::api::{Api, Patch, PatchParams};
use kube::Resource;
use serde::{de::DeserializeOwned, Serialize};

use crate::crd::PostgresCluster;
use crate::error::{Error, Result};

/// Field manager identifying this operator's server-side apply writes
pub const FIELD_MANAGER: &str = "postgres-cluster-operator";

/// Apply the desired state of an object with a server-side apply patch.
/// Idempotent: the API server merges the intent, and repeated calls with
/// the same object are no-ops.
pub async fn apply<K>(api: &Api<K>, operation: &'static str, obj: &K) -> Result<K>
where
    K: Resource + Clone + std::fmt::Debug + DeserializeOwned + Serialize,
    K::DynamicType: Default,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::config(format!("{}: object has no name", operation)))?;

    // Server-side apply requires apiVersion and kind in the payload, which
    // typed objects do not serialize on their own.
    let dt = K::DynamicType::default();
    let mut intent = serde_json::to_value(obj)?;
    intent["apiVersion"] = K::api_version(&dt).to_string().into();
    intent["kind"] = K::kind(&dt).to_string().into();

    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&intent),
    )
    .await
    .map_err(|e| Error::patch(operation, name, e))
}

/// Point an object at the cluster with a controller owner reference, so the
/// API server garbage-collects it when the cluster is finally removed.
/// Must be called before the object is first written.
pub fn set_controller_reference<K>(cluster: &PostgresCluster, obj: &mut K) -> Result<()>
where
    K: Resource,
{
    let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::config(format!(
            "cluster {} has no name or uid for an owner reference",
            cluster.meta().name.as_deref().unwrap_or("")
        ))
    })?;
    obj.meta_mut().owner_references = Some(vec![owner]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Backups, PgBackRestArchive, PostgresClusterSpec};
    use k8s_openapi::api::core::v1::ConfigMap;

    fn cluster() -> PostgresCluster {
        let mut cluster = PostgresCluster::new(
            "hippo",
            PostgresClusterSpec {
                port: 5432,
                postgres_version: 16,
                metadata: None,
                backups: Backups {
                    pgbackrest: PgBackRestArchive::default(),
                },
            },
        );
        cluster.metadata.namespace = Some("ns1".to_string());
        cluster.metadata.uid = Some("uid-123".to_string());
        cluster
    }

    #[test]
    fn controller_reference_targets_the_cluster() {
        let cluster = cluster();
        let mut configmap = ConfigMap::default();

        set_controller_reference(&cluster, &mut configmap).unwrap();

        let refs = configmap.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "PostgresCluster");
        assert_eq!(refs[0].name, "hippo");
        assert_eq!(refs[0].uid, "uid-123");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn controller_reference_requires_a_uid() {
        let mut cluster = cluster();
        cluster.metadata.uid = None;
        let mut configmap = ConfigMap::default();

        assert!(set_controller_reference(&cluster, &mut configmap).is_err());
    }
}
