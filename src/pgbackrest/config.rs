//! Deterministic pgBackRest configuration synthesis.
//!
//! Everything here is a pure function of the PostgresCluster spec and a few
//! topology parameters. The generated text is parsed literally by
//! pgBackRest, so the exact shape (section headers, `key = value` lines,
//! lexicographic key order, single trailing newline) is part of the
//! contract and pinned by snapshot tests.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

use crate::crd::{PostgresCluster, RepoStorage};
use crate::naming;

/// ConfigMap key of the configuration used by Postgres instance pods
pub const CM_INSTANCE_KEY: &str = "pgbackrest_instance.conf";

/// ConfigMap key of the configuration used by the dedicated repository host
pub const CM_REPO_KEY: &str = "pgbackrest_repo.conf";

/// ConfigMap key of the pgBackRest TLS server configuration
pub const CM_SERVER_KEY: &str = "pgbackrest-server.conf";

/// ConfigMap key carrying the hash of the desired backup configuration.
/// The hash is computed by the caller from the full desired state; it is a
/// change-detection side channel, not part of the generated text.
pub const CONFIG_HASH_KEY: &str = "config-hash";

/// The stanza covering the cluster's database instances
pub const DEFAULT_STANZA_NAME: &str = "db";

const INI_GENERATED_WARNING: &str =
    "# Generated by postgres-cluster-operator. DO NOT EDIT.\n# Your changes will not be saved.\n";

const REPO_MOUNT_PATH: &str = "/pgbackrest";
const POSTGRES_SOCKET_PATH: &str = "/tmp/postgres";

const TLS_CA_FILE: &str = "/etc/pgbackrest/conf.d/~postgres-cluster-operator/tls-ca.crt";
const TLS_CLIENT_CERT_FILE: &str =
    "/etc/pgbackrest/conf.d/~postgres-cluster-operator/client-tls.crt";
const TLS_CLIENT_KEY_FILE: &str =
    "/etc/pgbackrest/conf.d/~postgres-cluster-operator/client-tls.key";
const TLS_SERVER_CERT_FILE: &str = "/etc/pgbackrest/server/server-tls.crt";
const TLS_SERVER_KEY_FILE: &str = "/etc/pgbackrest/server/server-tls.key";

/// An ini document: named sections of sorted `key = value` lines.
///
/// Sections render in insertion order; keys within a section render in
/// lexicographic order because they live in a BTreeMap. Rendering never
/// depends on the order options were inserted.
#[derive(Debug, Default)]
struct IniDocument {
    sections: Vec<(String, BTreeMap<String, String>)>,
}

impl IniDocument {
    fn add_section(&mut self, name: &str, values: BTreeMap<String, String>) {
        self.sections.push((name.to_string(), values));
    }
}

impl fmt::Display for IniDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, values) in &self.sections {
            writeln!(f, "\n[{}]", name)?;
            for (key, value) in values {
                writeln!(f, "{} = {}", key, value)?;
            }
        }
        Ok(())
    }
}

fn document(ini: &IniDocument) -> String {
    format!("{}{}", INI_GENERATED_WARNING, ini)
}

/// Data directory of the cluster's Postgres version
pub fn postgres_data_directory(cluster: &PostgresCluster) -> String {
    format!("/pgdata/pg{}", cluster.spec.postgres_version)
}

/// Whether any repository is backed by a volume, which requires a dedicated
/// repository host
pub fn repo_host_volume_defined(cluster: &PostgresCluster) -> bool {
    cluster
        .spec
        .backups
        .pgbackrest
        .repos
        .iter()
        .any(|repo| matches!(repo.storage, RepoStorage::Volume(_)))
}

fn repo_path(repo_name: &str) -> String {
    format!("{}/{}", REPO_MOUNT_PATH, repo_name)
}

/// FQDN of ordinal 0 of a StatefulSet governed by the cluster pod service
fn pod_host(host: &str, service_name: &str, namespace: &str, cluster_domain: &str) -> String {
    format!(
        "{}-0.{}.{}.svc.{}",
        host, service_name, namespace, cluster_domain
    )
}

/// Build the ConfigMap carrying every generated pgBackRest configuration
/// document for the cluster.
///
/// Pure: identical inputs produce a byte-identical ConfigMap. The instance
/// configuration and the config hash are always present. The repository
/// host configuration and a populated server configuration are only emitted
/// when a volume-backed repository requires a dedicated host; the server
/// key itself is always present so downstream mounts never miss it.
#[allow(clippy::too_many_arguments)]
pub fn create_pgbackrest_configmap(
    cluster: &PostgresCluster,
    repo_host_name: &str,
    config_hash: &str,
    service_name: &str,
    service_namespace: &str,
    instance_names: &[String],
    cluster_domain: &str,
) -> ConfigMap {
    let archive = &cluster.spec.backups.pgbackrest;

    let mut configmap = ConfigMap {
        metadata: naming::pgbackrest_configmap(cluster),
        ..Default::default()
    };

    let empty = Default::default();
    let cluster_meta = cluster.spec.metadata.as_ref();
    let backups_meta = archive.metadata.as_ref();

    configmap.metadata.annotations = Some(naming::merge(&[
        cluster_meta.map(|m| &m.annotations).unwrap_or(&empty),
        backups_meta.map(|m| &m.annotations).unwrap_or(&empty),
    ]));
    let operator_labels: BTreeMap<String, String> = [
        (naming::LABEL_CLUSTER.to_string(), cluster.name_any()),
        (naming::LABEL_PGBACKREST.to_string(), String::new()),
        (naming::LABEL_PGBACKREST_CONFIG.to_string(), String::new()),
    ]
    .into();
    configmap.metadata.labels = Some(naming::merge(&[
        cluster_meta.map(|m| &m.labels).unwrap_or(&empty),
        backups_meta.map(|m| &m.labels).unwrap_or(&empty),
        &operator_labels,
    ]));

    let mut data = BTreeMap::new();

    data.insert(
        CM_INSTANCE_KEY.to_string(),
        document(&instance_settings(
            cluster,
            repo_host_name,
            service_name,
            service_namespace,
            cluster_domain,
        )),
    );

    // The server key must exist even when there is nothing to put in it.
    data.insert(CM_SERVER_KEY.to_string(), String::new());

    if repo_host_volume_defined(cluster) {
        data.insert(
            CM_REPO_KEY.to_string(),
            document(&repo_host_settings(
                cluster,
                service_name,
                service_namespace,
                instance_names,
                cluster_domain,
            )),
        );
        data.insert(CM_SERVER_KEY.to_string(), document(&server_settings(cluster)));
    }

    data.insert(CONFIG_HASH_KEY.to_string(), config_hash.to_string());

    configmap.data = Some(data);
    configmap
}

/// Options common to every repository, regardless of which document they
/// are rendered into. Volume-backed repositories contribute only their
/// path; object-store repositories contribute their backend options and a
/// `repoN-type`.
fn add_repo_options(global: &mut BTreeMap<String, String>, cluster: &PostgresCluster) {
    for repo in &cluster.spec.backups.pgbackrest.repos {
        global.insert(format!("{}-path", repo.name), repo_path(&repo.name));

        match &repo.storage {
            RepoStorage::Volume(_) => {}
            RepoStorage::Azure(azure) => {
                global.insert(
                    format!("{}-azure-container", repo.name),
                    azure.container.clone(),
                );
                global.insert(format!("{}-type", repo.name), "azure".to_string());
            }
            RepoStorage::Gcs(gcs) => {
                global.insert(format!("{}-gcs-bucket", repo.name), gcs.bucket.clone());
                global.insert(format!("{}-type", repo.name), "gcs".to_string());
            }
            RepoStorage::S3(s3) => {
                global.insert(format!("{}-s3-bucket", repo.name), s3.bucket.clone());
                global.insert(format!("{}-s3-endpoint", repo.name), s3.endpoint.clone());
                global.insert(format!("{}-s3-region", repo.name), s3.region.clone());
                global.insert(format!("{}-type", repo.name), "s3".to_string());
            }
        }
    }

    // User-supplied global options win on key collision.
    for (key, value) in &cluster.spec.backups.pgbackrest.global {
        global.insert(key.clone(), value.clone());
    }
}

/// Configuration mounted into Postgres instance pods
fn instance_settings(
    cluster: &PostgresCluster,
    repo_host_name: &str,
    service_name: &str,
    service_namespace: &str,
    cluster_domain: &str,
) -> IniDocument {
    let mut global = BTreeMap::new();
    global.insert("log-path".to_string(), "/pgdata/pgbackrest/log".to_string());

    // Volume-backed repositories live on the dedicated repository host, so
    // instances reach them over pgBackRest's TLS protocol.
    if !repo_host_name.is_empty() {
        for repo in &cluster.spec.backups.pgbackrest.repos {
            if matches!(repo.storage, RepoStorage::Volume(_)) {
                global.insert(
                    format!("{}-host", repo.name),
                    pod_host(repo_host_name, service_name, service_namespace, cluster_domain),
                );
                global.insert(format!("{}-host-ca-file", repo.name), TLS_CA_FILE.to_string());
                global.insert(
                    format!("{}-host-cert-file", repo.name),
                    TLS_CLIENT_CERT_FILE.to_string(),
                );
                global.insert(
                    format!("{}-host-key-file", repo.name),
                    TLS_CLIENT_KEY_FILE.to_string(),
                );
                global.insert(format!("{}-host-type", repo.name), "tls".to_string());
                global.insert(format!("{}-host-user", repo.name), "postgres".to_string());
            }
        }
    }

    add_repo_options(&mut global, cluster);

    let mut db = BTreeMap::new();
    db.insert("pg1-path".to_string(), postgres_data_directory(cluster));
    db.insert("pg1-port".to_string(), cluster.spec.port.to_string());
    db.insert("pg1-socket-path".to_string(), POSTGRES_SOCKET_PATH.to_string());

    let mut ini = IniDocument::default();
    ini.add_section("global", global);
    ini.add_section(DEFAULT_STANZA_NAME, db);
    ini
}

/// Configuration mounted into the dedicated repository host
fn repo_host_settings(
    cluster: &PostgresCluster,
    service_name: &str,
    service_namespace: &str,
    instance_names: &[String],
    cluster_domain: &str,
) -> IniDocument {
    let mut global = BTreeMap::new();

    // Logs land on the first volume-backed repository.
    if let Some(repo) = cluster
        .spec
        .backups
        .pgbackrest
        .repos
        .iter()
        .find(|repo| matches!(repo.storage, RepoStorage::Volume(_)))
    {
        global.insert("log-path".to_string(), format!("{}/log", repo_path(&repo.name)));
    }

    add_repo_options(&mut global, cluster);

    // The repository host reaches every database instance over TLS.
    let mut db = BTreeMap::new();
    for (index, instance) in instance_names.iter().enumerate() {
        let pg = format!("pg{}", index + 1);
        db.insert(
            format!("{}-host", pg),
            pod_host(instance, service_name, service_namespace, cluster_domain),
        );
        db.insert(format!("{}-host-ca-file", pg), TLS_CA_FILE.to_string());
        db.insert(format!("{}-host-cert-file", pg), TLS_CLIENT_CERT_FILE.to_string());
        db.insert(format!("{}-host-key-file", pg), TLS_CLIENT_KEY_FILE.to_string());
        db.insert(format!("{}-host-type", pg), "tls".to_string());
        db.insert(format!("{}-path", pg), postgres_data_directory(cluster));
        db.insert(format!("{}-port", pg), cluster.spec.port.to_string());
        db.insert(format!("{}-socket-path", pg), POSTGRES_SOCKET_PATH.to_string());
    }

    let mut ini = IniDocument::default();
    ini.add_section("global", global);
    ini.add_section(DEFAULT_STANZA_NAME, db);
    ini
}

/// pgBackRest TLS server configuration, parameterized only by the cluster's
/// UID (the authorized client common name)
fn server_settings(cluster: &PostgresCluster) -> IniDocument {
    let uid = cluster.uid().unwrap_or_default();

    let mut global = BTreeMap::new();
    global.insert("tls-server-address".to_string(), "0.0.0.0".to_string());
    global.insert("tls-server-auth".to_string(), format!("pgbackrest@{}=*", uid));
    global.insert("tls-server-ca-file".to_string(), TLS_CA_FILE.to_string());
    global.insert("tls-server-cert-file".to_string(), TLS_SERVER_CERT_FILE.to_string());
    global.insert("tls-server-key-file".to_string(), TLS_SERVER_KEY_FILE.to_string());

    let mut server = BTreeMap::new();
    server.insert("log-level-console".to_string(), "detail".to_string());
    server.insert("log-level-file".to_string(), "off".to_string());
    server.insert("log-level-stderr".to_string(), "error".to_string());
    server.insert("log-timestamp".to_string(), "n".to_string());

    let mut ini = IniDocument::default();
    ini.add_section("global", global);
    ini.add_section("global:server", server);
    ini
}

/// Render the TLS server configuration without the generated-file header.
/// The simplest of the documents, useful as a canary for the renderer.
pub fn server_config(cluster: &PostgresCluster) -> String {
    server_settings(cluster).to_string()
}
