//! PostgresCluster reconciler
//!
//! Handles one cluster's complete desired state per pass:
//! - Deletion gate (finalizer state machine) before anything else
//! - Spec validation
//! - Instance RBAC provisioning
//! - pgBackRest configuration synthesis and apply, gated on a content hash

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::crd::PostgresCluster;
use crate::error::{Error, Result};
use crate::metrics;
use crate::naming;
use crate::pgbackrest;
use crate::reconcilers::apply::{apply, set_controller_reference, FIELD_MANAGER};
use crate::reconcilers::delete::{handle_delete, KubeClusterStore};
use crate::reconcilers::rbac;

/// How long to wait before re-checking a healthy cluster
const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(300);

/// Validate the PostgresCluster spec. Malformed input is a programmer or
/// configuration error: surfaced immediately, never retried internally.
pub fn validate(cluster: &PostgresCluster) -> Result<()> {
    let spec = &cluster.spec;

    if !(10..=17).contains(&spec.postgres_version) {
        return Err(Error::validation(format!(
            "Unsupported postgresVersion {}: must be between 10 and 17",
            spec.postgres_version
        )));
    }

    if !(1..=65535).contains(&spec.port) {
        return Err(Error::validation(format!(
            "Invalid port {}: must be between 1 and 65535",
            spec.port
        )));
    }

    // Repositories follow a fixed ordinal naming scheme: repo1..repoN in
    // ascending order with no gaps. Generated option keys derive from
    // these names, so an inconsistent sequence would corrupt the output.
    for (index, repo) in spec.backups.pgbackrest.repos.iter().enumerate() {
        let expected = format!("repo{}", index + 1);
        if repo.name != expected {
            return Err(Error::validation(format!(
                "Repository at position {} is named '{}': must be '{}'",
                index + 1,
                repo.name,
                expected
            )));
        }
    }

    Ok(())
}

/// Hash of the full desired backup configuration. Computed from the spec,
/// not the generated text, so formatting changes that do not alter
/// semantics leave the hash stable.
pub fn config_hash(cluster: &PostgresCluster) -> Result<String> {
    let bytes = serde_json::to_vec(&cluster.spec.backups)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(&digest[..8]))
}

/// Names of the cluster's instance StatefulSets, in stable order
async fn instance_names(client: &Client, cluster: &PostgresCluster) -> Result<Vec<String>> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);

    let sets = api
        .list(&ListParams::default().labels(&naming::cluster_instances_selector(cluster)))
        .await?;

    let mut names: Vec<String> = sets.iter().map(|set| set.name_any()).collect();
    names.sort();
    Ok(names)
}

/// Main reconciliation pass for one cluster
pub async fn reconcile(cluster: &PostgresCluster, client: &Client) -> Result<Action> {
    let store = KubeClusterStore::new(client.clone());
    if let Some(action) = handle_delete(&store, cluster).await? {
        metrics::DELETIONS.with_label_values(&["PostgresCluster"]).inc();
        return Ok(action);
    }

    if let Err(e) = validate(cluster) {
        warn!(error = %e, "Validation failed");
        update_status_failed(cluster, client, &e.to_string()).await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    rbac::reconcile_instance_rbac(client, cluster).await?;

    let hash = config_hash(cluster)?;
    let namespace = cluster.namespace().unwrap_or_default();
    let instances = instance_names(client, cluster).await?;
    let repo_host = if pgbackrest::repo_host_volume_defined(cluster) {
        naming::repo_host_name(cluster)
    } else {
        String::new()
    };

    let mut configmap = pgbackrest::create_pgbackrest_configmap(
        cluster,
        &repo_host,
        &hash,
        &naming::cluster_pod_service(cluster),
        &namespace,
        &instances,
        &naming::kubernetes_cluster_domain(),
    );
    set_controller_reference(cluster, &mut configmap)?;

    let configmap_api: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    if stored_hash(&configmap_api, &configmap).await?.as_deref() == Some(hash.as_str()) {
        // Stored configuration already reflects the desired state.
        debug!(cluster = %naming::cluster_key(cluster), hash = %hash, "configuration unchanged");
        metrics::CONFIG_WRITES_SKIPPED
            .with_label_values(&["PostgresCluster"])
            .inc();
    } else {
        apply(&configmap_api, "apply pgbackrest configmap", &configmap).await?;
        info!(cluster = %naming::cluster_key(cluster), hash = %hash, "wrote pgbackrest configuration");
    }

    update_status_ready(cluster, client, &hash).await?;
    Ok(Action::requeue(STEADY_STATE_REQUEUE))
}

/// The config hash last written to the store, if the ConfigMap exists
async fn stored_hash(api: &Api<ConfigMap>, configmap: &ConfigMap) -> Result<Option<String>> {
    let name = configmap.name_any();
    let existing = api.get_opt(&name).await?;
    Ok(existing
        .and_then(|cm| cm.data)
        .and_then(|mut data| data.remove(pgbackrest::CONFIG_HASH_KEY)))
}

/// Update status to Ready
async fn update_status_ready(
    cluster: &PostgresCluster,
    client: &Client,
    hash: &str,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), &namespace);

    let status = json!({
        "status": {
            "phase": "Ready",
            "message": "Cluster resources are up to date",
            "configHash": hash,
            "observedGeneration": cluster.metadata.generation,
            "conditions": [{
                "type": "Ready",
                "status": "True",
                "lastTransitionTime": Utc::now(),
                "reason": "ReconcileSucceeded",
                "message": "Configuration and RBAC applied"
            }]
        }
    });

    api.patch_status(
        &cluster.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(status),
    )
    .await?;
    Ok(())
}

/// Update status to Failed
async fn update_status_failed(
    cluster: &PostgresCluster,
    client: &Client,
    error_message: &str,
) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api: Api<PostgresCluster> = Api::namespaced(client.clone(), &namespace);

    let status = json!({
        "status": {
            "phase": "Failed",
            "message": error_message,
            "observedGeneration": cluster.metadata.generation,
            "conditions": [{
                "type": "Ready",
                "status": "False",
                "lastTransitionTime": Utc::now(),
                "reason": "ValidationFailed",
                "message": error_message
            }]
        }
    });

    api.patch_status(
        &cluster.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(status),
    )
    .await?;
    Ok(())
}
