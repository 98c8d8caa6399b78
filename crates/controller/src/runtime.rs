//! kube runtime wiring: watch Clusters and the objects they own, run a bounded pool of passes.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};
use trellis_core::prelude::*;
use trellis_plan::Services;

use crate::{next_action, reconcile_pass, retry_action};

/// Where and how wide the controller runs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    /// Passes allowed in flight at once; 0 leaves it unbounded.
    pub concurrency: u16,
}

struct Shared {
    services: Services,
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn reconcile(cluster: Arc<Cluster>, shared: Arc<Shared>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let outcome = reconcile_pass(&shared.services, &ns, &cluster.name_any()).await?;
    Ok(next_action(&outcome, &shared.services.config))
}

fn error_policy(cluster: Arc<Cluster>, err: &Error, shared: Arc<Shared>) -> Action {
    debug!(cluster = %cluster.name_any(), error = %err, "scheduling retry");
    retry_action(&shared.services.config)
}

/// Run until the process receives a shutdown signal.
pub async fn run(client: Client, services: Services, opts: RunOptions) -> anyhow::Result<()> {
    let ns = opts.namespace.as_deref();
    let wc = watcher::Config::default();
    let shared = Arc::new(Shared { services });
    info!(namespace = ?ns, concurrency = opts.concurrency, "controller starting");

    Controller::new(api::<Cluster>(&client, ns), wc.clone())
        .owns(api::<InstanceSet>(&client, ns), wc.clone())
        .owns(api::<ComponentParameter>(&client, ns), wc.clone())
        .owns(api::<Backup>(&client, ns), wc.clone())
        .owns(api::<Restore>(&client, ns), wc)
        .with_config(controller::Config::default().concurrency(opts.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, shared)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(cluster = %obj.name, "reconciled"),
                Err(controller::Error::ReconcilerFailed(e, obj)) => {
                    debug!(cluster = %obj.name, error = %e, "reconcile failed")
                }
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;

    info!("controller stopped");
    Ok(())
}
