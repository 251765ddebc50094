//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifest for the PostgresCluster
//! resource.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use postgres_cluster_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
