//! RBAC resources for the cluster's database instances.
//!
//! The ServiceAccount, Role, and RoleBinding share one derived name and are
//! all owned by the cluster, so the API server reclaims them when the
//! cluster goes away. This provisioner participates in neither the
//! finalizer protocol nor manual deletion.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::{Api, Client, ResourceExt};

use crate::crd::PostgresCluster;
use crate::error::Result;
use crate::naming;
use crate::reconcilers::apply::{apply, set_controller_reference};

/// Permission rules Patroni needs inside instance pods: it maintains
/// leader-election Endpoints and labels its own pods.
fn instance_permissions(_cluster: &PostgresCluster) -> Vec<PolicyRule> {
    let verbs = |list: &[&str]| list.iter().map(|v| v.to_string()).collect::<Vec<_>>();

    vec![
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["endpoints".to_string()]),
            verbs: verbs(&["create", "deletecollection", "get", "list", "patch", "watch"]),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string()]),
            verbs: verbs(&["get", "list", "patch", "watch"]),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["services".to_string()]),
            verbs: verbs(&["create"]),
            ..Default::default()
        },
    ]
}

/// The desired ServiceAccount, Role, and RoleBinding for instance pods.
/// Pure except for reading the cluster; the binding references the other
/// two by name, so no read-back is needed.
pub fn instance_rbac_intent(
    cluster: &PostgresCluster,
) -> Result<(ServiceAccount, Role, RoleBinding)> {
    let mut account = ServiceAccount {
        metadata: naming::cluster_instance_rbac(cluster),
        ..Default::default()
    };
    let mut role = Role {
        metadata: naming::cluster_instance_rbac(cluster),
        ..Default::default()
    };
    let mut binding = RoleBinding {
        metadata: naming::cluster_instance_rbac(cluster),
        ..Default::default()
    };

    set_controller_reference(cluster, &mut account)?;
    set_controller_reference(cluster, &mut role)?;
    set_controller_reference(cluster, &mut binding)?;

    let empty = Default::default();
    let cluster_meta = cluster.spec.metadata.as_ref();
    let operator_labels: BTreeMap<String, String> =
        [(naming::LABEL_CLUSTER.to_string(), cluster.name_any())].into();

    let annotations =
        naming::merge(&[cluster_meta.map(|m| &m.annotations).unwrap_or(&empty)]);
    let labels = naming::merge(&[
        cluster_meta.map(|m| &m.labels).unwrap_or(&empty),
        &operator_labels,
    ]);

    for meta in [
        &mut account.metadata,
        &mut role.metadata,
        &mut binding.metadata,
    ] {
        meta.annotations = Some(annotations.clone());
        meta.labels = Some(labels.clone());
    }

    account.automount_service_account_token = Some(true);
    role.rules = Some(instance_permissions(cluster));
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: role.name_any(),
    };
    binding.subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: account.name_any(),
        namespace: cluster.namespace(),
        ..Default::default()
    }]);

    Ok((account, role, binding))
}

/// Write the ServiceAccount, Role, and RoleBinding for all instances of the
/// cluster. Returns the ServiceAccount carrying the authorization an
/// instance pod needs. The first failed write aborts the rest.
pub async fn reconcile_instance_rbac(
    client: &Client,
    cluster: &PostgresCluster,
) -> Result<ServiceAccount> {
    let (account, role, binding) = instance_rbac_intent(cluster)?;
    let namespace = cluster.namespace().unwrap_or_default();

    let account_api: Api<ServiceAccount> = Api::namespaced(client.clone(), &namespace);
    let role_api: Api<Role> = Api::namespaced(client.clone(), &namespace);
    let binding_api: Api<RoleBinding> = Api::namespaced(client.clone(), &namespace);

    let account = apply(&account_api, "apply serviceaccount", &account).await?;
    apply(&role_api, "apply role", &role).await?;
    apply(&binding_api, "apply rolebinding", &binding).await?;

    Ok(account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Backups, Metadata, PgBackRestArchive, PostgresClusterSpec};
    use std::collections::BTreeMap;

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

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn all_three_objects_share_name_and_owner() {
        let (account, role, binding) = instance_rbac_intent(&cluster()).unwrap();

        assert_eq!(account.name_any(), "hippo-instance");
        assert_eq!(role.name_any(), "hippo-instance");
        assert_eq!(binding.name_any(), "hippo-instance");

        for meta in [&account.metadata, &role.metadata, &binding.metadata] {
            let refs = meta.owner_references.as_ref().unwrap();
            assert_eq!(refs[0].name, "hippo");
            assert_eq!(refs[0].controller, Some(true));
        }
    }

    #[test]
    fn binding_references_account_and_role_by_name() {
        let (account, role, binding) = instance_rbac_intent(&cluster()).unwrap();

        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, role.name_any());

        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, account.name_any());
    }

    #[test]
    fn account_mounts_its_token() {
        let (account, _, _) = instance_rbac_intent(&cluster()).unwrap();
        assert_eq!(account.automount_service_account_token, Some(true));
    }

    #[test]
    fn cluster_metadata_is_merged_into_labels() {
        let mut cluster = cluster();
        cluster.spec.metadata = Some(Metadata {
            labels: map(&[
                ("team", "storage"),
                // The operator's own label always wins.
                (naming::LABEL_CLUSTER, "ignored"),
            ]),
            annotations: map(&[("note", "hello")]),
        });

        let (account, _, _) = instance_rbac_intent(&cluster).unwrap();
        let labels = account.metadata.labels.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("storage"));
        assert_eq!(
            labels.get(naming::LABEL_CLUSTER).map(String::as_str),
            Some("hippo")
        );
        assert_eq!(
            account.metadata.annotations.unwrap(),
            map(&[("note", "hello")])
        );
    }

    #[test]
    fn role_carries_patroni_permissions() {
        let (_, role, _) = instance_rbac_intent(&cluster()).unwrap();
        let rules = role.rules.unwrap();
        assert!(rules
            .iter()
            .any(|r| r.resources.as_deref() == Some(&["endpoints".to_string()][..])));
        assert!(rules
            .iter()
            .any(|r| r.resources.as_deref() == Some(&["pods".to_string()][..])));
    }
}
