//! Finalizer handling and ordered teardown for PostgresCluster deletion.
//!
//! The machine holds no state between invocations: each call re-derives its
//! position from the deletion timestamp and finalizer list of the cluster
//! it is handed. Every mutation of the finalizer list is a merge-patch
//! conditioned on the resourceVersion the cluster was last read at, because
//! the list is shared with other controllers and a lost race must surface
//! as a conflict rather than a silent merge.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::PostgresCluster;
use crate::error::{is_kube_not_found, Error, Result};
use crate::naming;

/// How long to wait before re-checking that instances are gone
const TEARDOWN_REQUEUE: Duration = Duration::from_secs(5);

/// Store operations the deletion state machine performs, split out so the
/// machine can be driven against an in-memory store in tests.
#[async_trait]
pub trait ClusterStore {
    /// Replace the cluster's finalizer list with a merge-patch conditioned
    /// on the resourceVersion the cluster was last read at. Fails with a
    /// retryable conflict when another writer changed the resource since.
    async fn patch_finalizers(
        &self,
        cluster: &PostgresCluster,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Remove the cluster's instance workloads. Returns true once they are
    /// all confirmed gone; instances that are already absent count as
    /// removed.
    async fn delete_instances(&self, cluster: &PostgresCluster) -> Result<bool>;

    /// Remove Patroni's coordination artifacts. Absence is success.
    async fn delete_coordination_artifacts(&self, cluster: &PostgresCluster) -> Result<()>;
}

/// Set a finalizer on the cluster, or run teardown when it is being
/// deleted. Returns `Ok(None)` when the cluster is not being deleted and
/// the caller should continue reconciling; `Ok(Some(_))` ends the pass.
pub async fn handle_delete<S>(store: &S, cluster: &PostgresCluster) -> Result<Option<Action>>
where
    S: ClusterStore + ?Sized,
{
    let finalizers = cluster.finalizers().to_vec();
    let finalized = finalizers.iter().any(|t| t.as_str() == naming::FINALIZER);

    if cluster.meta().deletion_timestamp.is_none() {
        if finalized {
            // Not being deleted and our finalizer is set; nothing to do.
            return Ok(None);
        }

        // Not being deleted and needs our finalizer; set it. The list is
        // shared by multiple controllers, so the patch carries the full
        // desired list plus the observed resourceVersion instead of
        // overwriting wholesale. A conflict propagates to the caller,
        // which re-observes and retries.
        debug!(cluster = %naming::cluster_key(cluster), "adding finalizer");
        let mut desired = finalizers;
        desired.push(naming::FINALIZER.to_string());
        store.patch_finalizers(cluster, desired).await?;
        return Ok(None);
    }

    if !finalized {
        // Being deleted and our finalizer is already gone, or we never
        // owned it. Wait for further events.
        return Ok(Some(Action::await_change()));
    }

    // Being deleted with our finalizer still set; run teardown in order.
    // Every step is idempotent, so a pass aborted part-way is safe to
    // re-enter.
    if !store.delete_instances(cluster).await? {
        return Ok(Some(Action::requeue(TEARDOWN_REQUEUE)));
    }

    // Instances are stopped; clean up what Patroni left behind.
    store.delete_coordination_artifacts(cluster).await?;

    // Teardown is finished; release only our token. Same conditional patch
    // discipline as above. Once the list is empty the API server removes
    // the resource.
    info!(cluster = %naming::cluster_key(cluster), "teardown complete, removing finalizer");
    let desired = finalizers
        .into_iter()
        .filter(|t| t.as_str() != naming::FINALIZER)
        .collect();
    store.patch_finalizers(cluster, desired).await?;

    Ok(Some(Action::await_change()))
}

/// Production store backed by the Kubernetes API
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn patch_finalizers(
        &self,
        cluster: &PostgresCluster,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let key = naming::cluster_key(cluster);
        let resource_version = cluster
            .resource_version()
            .ok_or_else(|| Error::MissingResourceVersion(key.clone()))?;

        let api: Api<PostgresCluster> = Api::namespaced(
            self.client.clone(),
            &cluster.namespace().unwrap_or_default(),
        );

        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });
        api.patch(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::patch("patch finalizers", key, e))?;
        Ok(())
    }

    async fn delete_instances(&self, cluster: &PostgresCluster) -> Result<bool> {
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);

        let sets = api
            .list(&ListParams::default().labels(&naming::cluster_instances_selector(cluster)))
            .await?;
        if sets.items.is_empty() {
            return Ok(true);
        }

        for set in sets {
            let name = set.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    debug!(statefulset = %name, "deleted instance statefulset");
                }
                Err(e) if is_kube_not_found(&e) => {}
                Err(e) => {
                    return Err(Error::patch(
                        "delete statefulset",
                        format!("{}/{}", namespace, name),
                        e,
                    ))
                }
            }
        }

        // Deletions were issued this pass; confirm absence on the next one.
        Ok(false)
    }

    async fn delete_coordination_artifacts(&self, cluster: &PostgresCluster) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);

        let artifacts = api
            .list(&ListParams::default().labels(&naming::patroni_artifacts_selector(cluster)))
            .await?;

        for endpoints in artifacts {
            let name = endpoints.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    debug!(endpoints = %name, "deleted patroni artifact");
                }
                Err(e) if is_kube_not_found(&e) => {}
                Err(e) => {
                    return Err(Error::patch(
                        "delete endpoints",
                        format!("{}/{}", namespace, name),
                        e,
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Backups, PgBackRestArchive, PostgresClusterSpec};
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory store emulating the API server's optimistic locking on the
    /// finalizer list
    #[derive(Default)]
    struct FakeStore {
        resource_version: Mutex<String>,
        finalizers: Mutex<Vec<String>>,
        patches: AtomicUsize,
        instances_gone: AtomicBool,
        fail_instance_teardown: AtomicBool,
    }

    impl FakeStore {
        fn with_version(version: &str) -> Self {
            let store = FakeStore::default();
            *store.resource_version.lock().unwrap() = version.to_string();
            store
        }

        /// A cluster as currently stored, the way the driver would hand it
        /// to the next invocation
        fn observe(&self, deleting: bool) -> PostgresCluster {
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
            cluster.metadata.resource_version =
                Some(self.resource_version.lock().unwrap().clone());
            cluster.metadata.finalizers = Some(self.finalizers.lock().unwrap().clone());
            if deleting {
                cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
            }
            cluster
        }

        fn stored_finalizers(&self) -> Vec<String> {
            self.finalizers.lock().unwrap().clone()
        }
    }

    fn conflict() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        })
    }

    #[async_trait]
    impl ClusterStore for FakeStore {
        async fn patch_finalizers(
            &self,
            cluster: &PostgresCluster,
            finalizers: Vec<String>,
        ) -> Result<()> {
            let stored_version = self.resource_version.lock().unwrap().clone();
            if cluster.resource_version().as_deref() != Some(stored_version.as_str()) {
                return Err(Error::patch(
                    "patch finalizers",
                    naming::cluster_key(cluster),
                    conflict(),
                ));
            }
            *self.finalizers.lock().unwrap() = finalizers;
            self.patches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_instances(&self, _cluster: &PostgresCluster) -> Result<bool> {
            if self.fail_instance_teardown.load(Ordering::SeqCst) {
                return Err(Error::patch(
                    "delete statefulset",
                    "ns1/hippo-instance1".to_string(),
                    kube::Error::Api(ErrorResponse {
                        status: "Failure".to_string(),
                        message: "unavailable".to_string(),
                        reason: "ServiceUnavailable".to_string(),
                        code: 503,
                    }),
                ));
            }
            Ok(self.instances_gone.load(Ordering::SeqCst))
        }

        async fn delete_coordination_artifacts(&self, _cluster: &PostgresCluster) -> Result<()> {
            Ok(())
        }
    }

    fn assert_awaits_change(action: Option<Action>) {
        let action = action.expect("pass should end");
        assert_eq!(format!("{:?}", action), format!("{:?}", Action::await_change()));
    }

    #[tokio::test]
    async fn adds_finalizer_once_and_is_idempotent() {
        let store = FakeStore::with_version("1");

        let result = handle_delete(&store, &store.observe(false)).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.stored_finalizers(), vec![naming::FINALIZER.to_string()]);

        // Re-observing and invoking again is a no-op with no further patch.
        let result = handle_delete(&store, &store.observe(false)).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.patches.load(Ordering::SeqCst), 1);
        assert_eq!(store.stored_finalizers(), vec![naming::FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn preserves_other_owners_tokens() {
        let store = FakeStore::with_version("1");
        *store.finalizers.lock().unwrap() = vec!["other.io/finalizer".to_string()];

        handle_delete(&store, &store.observe(false)).await.unwrap();
        assert_eq!(
            store.stored_finalizers(),
            vec!["other.io/finalizer".to_string(), naming::FINALIZER.to_string()]
        );
    }

    #[tokio::test]
    async fn concurrent_writer_surfaces_as_conflict() {
        let store = FakeStore::with_version("1");
        let observed = store.observe(false);

        // Another writer bumps the stored version between read and patch.
        *store.resource_version.lock().unwrap() = "2".to_string();

        let err = handle_delete(&store, &observed).await.unwrap_err();
        assert!(err.is_conflict());
        // The stored list is exactly as last stored; no partial merge.
        assert!(store.stored_finalizers().is_empty());
    }

    #[tokio::test]
    async fn deleting_without_finalizer_waits_for_events() {
        let store = FakeStore::with_version("1");

        let result = handle_delete(&store, &store.observe(true)).await.unwrap();
        assert_awaits_change(result);
        assert_eq!(store.patches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn teardown_failure_keeps_finalizer() {
        let store = FakeStore::with_version("1");
        *store.finalizers.lock().unwrap() = vec![naming::FINALIZER.to_string()];
        store.fail_instance_teardown.store(true, Ordering::SeqCst);

        let err = handle_delete(&store, &store.observe(true)).await.unwrap_err();
        assert!(!err.is_conflict());
        assert_eq!(store.stored_finalizers(), vec![naming::FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn requeues_until_instances_are_gone_then_removes_finalizer() {
        let store = FakeStore::with_version("1");
        *store.finalizers.lock().unwrap() =
            vec!["other.io/finalizer".to_string(), naming::FINALIZER.to_string()];

        // Instances still present: the pass ends with a requeue and the
        // finalizer stays.
        let action = handle_delete(&store, &store.observe(true))
            .await
            .unwrap()
            .expect("pass should end");
        assert_eq!(
            format!("{:?}", action),
            format!("{:?}", Action::requeue(TEARDOWN_REQUEUE))
        );
        assert!(store
            .stored_finalizers()
            .iter()
            .any(|t| t.as_str() == naming::FINALIZER));

        // Instances confirmed gone: teardown completes and only our token
        // is released.
        store.instances_gone.store(true, Ordering::SeqCst);
        let result = handle_delete(&store, &store.observe(true)).await.unwrap();
        assert_awaits_change(result);
        assert_eq!(store.stored_finalizers(), vec!["other.io/finalizer".to_string()]);
    }
}
