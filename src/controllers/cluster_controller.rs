//! PostgresCluster controller
//!
//! Watches PostgresCluster resources and triggers reconciliation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument};

use crate::controllers::Context;
use crate::crd::PostgresCluster;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::cluster as cluster_reconciler;

/// Run the PostgresCluster controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<PostgresCluster> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("PostgresCluster CRD not installed: {}", e);
        return;
    }

    info!("Starting PostgresCluster controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled PostgresCluster"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS
                        .with_label_values(&["PostgresCluster"])
                        .inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace().as_deref().unwrap_or("default")))]
async fn reconcile(obj: Arc<PostgresCluster>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&["PostgresCluster"])
        .start_timer();
    metrics::RECONCILIATIONS
        .with_label_values(&["PostgresCluster"])
        .inc();

    cluster_reconciler::reconcile(&obj, &ctx.client).await
}

/// Error policy for the controller
fn error_policy(obj: Arc<PostgresCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        "Reconciliation failed, scheduling retry"
    );

    // Conflicts mean another writer touched a shared field; re-observe
    // promptly. Validation errors only resolve when the spec changes.
    let requeue_duration = if error.is_conflict() {
        Duration::from_secs(1)
    } else {
        match error {
            Error::Validation(_) | Error::Config(_) => Duration::from_secs(300),
            _ => Duration::from_secs(30),
        }
    };

    Action::requeue(requeue_duration)
}
