//! PostgresCluster Custom Resource Definition

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster resource specification
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "postgres.cluster-operator.io",
    version = "v1beta1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    singular = "postgrescluster",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name": "Version", "type": "integer", "jsonPath": ".spec.postgresVersion"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Port on which Postgres listens
    #[serde(default = "default_port")]
    pub port: i32,

    /// Major version of Postgres to run
    pub postgres_version: i32,

    /// Labels and annotations applied to every resource created for the
    /// cluster
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,

    /// Backup configuration
    pub backups: Backups,
}

fn default_port() -> i32 {
    5432
}

/// Labels and annotations attached to managed resources
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Backup configuration for the cluster
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Backups {
    /// pgBackRest archive configuration
    pub pgbackrest: PgBackRestArchive,
}

/// pgBackRest repositories and option overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestArchive {
    /// Global pgBackRest options applied to every generated configuration
    /// file. Values here win over operator-derived options with the same
    /// key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: BTreeMap<String, String>,

    /// Backup repositories, named repo1..repoN in ascending order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<PgBackRestRepo>,

    /// Labels and annotations applied to backup resources, winning over
    /// cluster-level metadata on key collision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// One backup repository. The storage field determines the backend; exactly
/// one backend is set per repository.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestRepo {
    /// Repository name, `repoN` where N is its ordinal position
    pub name: String,

    #[serde(flatten)]
    pub storage: RepoStorage,
}

/// Storage backend of a backup repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RepoStorage {
    /// A persistent volume mounted on the dedicated repository host
    Volume(RepoVolume),
    /// Azure Blob Storage
    Azure(RepoAzure),
    /// Google Cloud Storage
    Gcs(RepoGcs),
    /// S3 or S3-compatible object storage
    S3(RepoS3),
}

/// Volume-backed repository storage
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoVolume {
    /// Storage class of the backing PersistentVolumeClaim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested size of the backing volume (e.g. "100Gi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Azure Blob Storage repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoAzure {
    /// Azure container name
    pub container: String,
}

/// Google Cloud Storage repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoGcs {
    /// GCS bucket name
    pub bucket: String,
}

/// S3-compatible repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoS3 {
    /// S3 bucket name
    pub bucket: String,

    /// S3 endpoint
    pub endpoint: String,

    /// S3 region
    pub region: String,
}

/// PostgresCluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Current phase (Pending, Ready, Failed, Deleting)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Hash of the backup configuration most recently written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,

    /// Observed generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status condition
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type
    pub type_: String,

    /// Status (True, False, Unknown)
    pub status: String,

    /// Last transition time
    pub last_transition_time: DateTime<Utc>,

    /// Reason for the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
