//! Integration tests for reconciler validation logic
//!
//! These tests verify that spec validation accepts valid clusters and
//! rejects malformed ones, and that the backup configuration hash tracks
//! exactly the backup portion of the spec.

use postgres_cluster_operator::crd::{
    Backups, PgBackRestArchive, PgBackRestRepo, PostgresCluster, PostgresClusterSpec, RepoGcs,
    RepoS3, RepoStorage, RepoVolume,
};
use postgres_cluster_operator::reconcilers::cluster::{config_hash, validate};

// ============================================================================
// Test Helpers
// ============================================================================

fn volume_repo(name: &str) -> PgBackRestRepo {
    PgBackRestRepo {
        name: name.to_string(),
        storage: RepoStorage::Volume(RepoVolume::default()),
    }
}

fn gcs_repo(name: &str) -> PgBackRestRepo {
    PgBackRestRepo {
        name: name.to_string(),
        storage: RepoStorage::Gcs(RepoGcs {
            bucket: "bucket".to_string(),
        }),
    }
}

fn cluster_with_repos(repos: Vec<PgBackRestRepo>) -> PostgresCluster {
    PostgresCluster::new(
        "hippo",
        PostgresClusterSpec {
            port: 5432,
            postgres_version: 16,
            metadata: None,
            backups: Backups {
                pgbackrest: PgBackRestArchive {
                    repos,
                    ..Default::default()
                },
            },
        },
    )
}

// ============================================================================
// Spec Validation Tests
// ============================================================================

#[test]
fn valid_cluster_passes() {
    let cluster = cluster_with_repos(vec![volume_repo("repo1"), gcs_repo("repo2")]);
    assert!(validate(&cluster).is_ok());
}

#[test]
fn empty_repo_list_passes() {
    let cluster = cluster_with_repos(vec![]);
    assert!(validate(&cluster).is_ok());
}

#[test]
fn repo_names_must_start_at_repo1() {
    let cluster = cluster_with_repos(vec![volume_repo("repo2")]);
    let err = validate(&cluster).unwrap_err();
    assert!(err.to_string().contains("repo1"));
}

#[test]
fn repo_names_must_have_no_gaps() {
    let cluster = cluster_with_repos(vec![volume_repo("repo1"), gcs_repo("repo3")]);
    assert!(validate(&cluster).is_err());
}

#[test]
fn duplicate_repo_names_are_rejected() {
    let cluster = cluster_with_repos(vec![volume_repo("repo1"), gcs_repo("repo1")]);
    assert!(validate(&cluster).is_err());
}

#[test]
fn postgres_version_must_be_supported() {
    let mut cluster = cluster_with_repos(vec![]);
    cluster.spec.postgres_version = 9;
    assert!(validate(&cluster).is_err());

    cluster.spec.postgres_version = 18;
    assert!(validate(&cluster).is_err());

    cluster.spec.postgres_version = 10;
    assert!(validate(&cluster).is_ok());
    cluster.spec.postgres_version = 17;
    assert!(validate(&cluster).is_ok());
}

#[test]
fn port_must_be_in_range() {
    let mut cluster = cluster_with_repos(vec![]);
    cluster.spec.port = 0;
    assert!(validate(&cluster).is_err());

    cluster.spec.port = 65536;
    assert!(validate(&cluster).is_err());

    cluster.spec.port = 5432;
    assert!(validate(&cluster).is_ok());
}

#[test]
fn s3_repo_in_sequence_passes() {
    let cluster = cluster_with_repos(vec![
        volume_repo("repo1"),
        PgBackRestRepo {
            name: "repo2".to_string(),
            storage: RepoStorage::S3(RepoS3 {
                bucket: "bucket".to_string(),
                endpoint: "s3.example.com".to_string(),
                region: "us-east-1".to_string(),
            }),
        },
    ]);
    assert!(validate(&cluster).is_ok());
}

// ============================================================================
// Config Hash Tests
// ============================================================================

#[test]
fn hash_is_stable_across_calls() {
    let cluster = cluster_with_repos(vec![volume_repo("repo1")]);
    assert_eq!(config_hash(&cluster).unwrap(), config_hash(&cluster).unwrap());
}

#[test]
fn hash_tracks_backup_changes() {
    let cluster = cluster_with_repos(vec![volume_repo("repo1")]);
    let before = config_hash(&cluster).unwrap();

    let mut changed = cluster.clone();
    changed
        .spec
        .backups
        .pgbackrest
        .global
        .insert("repo1-retention-full".to_string(), "2".to_string());
    assert_ne!(before, config_hash(&changed).unwrap());

    let mut more_repos = cluster.clone();
    more_repos.spec.backups.pgbackrest.repos.push(gcs_repo("repo2"));
    assert_ne!(before, config_hash(&more_repos).unwrap());
}

#[test]
fn hash_ignores_everything_outside_backups() {
    let cluster = cluster_with_repos(vec![volume_repo("repo1")]);
    let before = config_hash(&cluster).unwrap();

    let mut unrelated = cluster;
    unrelated.spec.port = 6432;
    unrelated.spec.postgres_version = 17;
    unrelated.metadata.name = Some("renamed".to_string());
    assert_eq!(before, config_hash(&unrelated).unwrap());
}
