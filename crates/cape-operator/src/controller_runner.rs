//! Controller runner - builds the three controller futures
//!
//! Construction is kept apart from running so the caller decides how the
//! futures are composed with the servers and leader election.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::controller::Config as RuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use cape_common::crd::{Cluster, ExternalCluster, ExternalControlPlane, ExternalMachine, Machine};
use cape_common::WATCH_FILTER_LABEL;
use cape_controller::controller::{cluster, control_plane, machine};
use cape_controller::watches::{
    cluster_to_external_cluster, cluster_to_external_control_plane, dispatch,
    machine_to_external_machine,
};
use cape_controller::{error_policy, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// so the API server closes idle watches before the client times out.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller run to completion
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// What the controllers watch and how hard they work
#[derive(Clone, Debug, Default)]
pub struct WatchScope {
    /// Only watch this namespace (`None` = all)
    pub namespace: Option<String>,
    /// Concurrent reconciles per controller (0 = unbounded)
    pub concurrency: u16,
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watcher config for the primary resource, narrowed to the watch-filter
/// shard when one is set
pub fn primary_watcher_config(watch_filter: Option<&str>) -> WatcherConfig {
    let config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    match watch_filter {
        Some(value) => config.labels(&format!("{WATCH_FILTER_LABEL}={value}")),
        None => config,
    }
}

fn secondary_watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the ExternalCluster, ExternalControlPlane, and ExternalMachine
/// controller futures
pub fn build_controllers(client: Client, ctx: Arc<Context>, scope: &WatchScope) -> Vec<ControllerFuture> {
    let ns = scope.namespace.as_deref();
    let filter = ctx.config.watch_filter.clone();
    let runtime_config = RuntimeConfig::default().concurrency(scope.concurrency);

    tracing::info!("- ExternalCluster controller");
    let cluster_ctrl = Controller::new(
        api::<ExternalCluster>(&client, ns),
        primary_watcher_config(filter.as_deref()),
    )
    .watches(
        api::<Cluster>(&client, ns),
        secondary_watcher_config(),
        dispatch(cluster_to_external_cluster),
    )
    .with_config(runtime_config.clone())
    .shutdown_on_signal()
    .run(cluster::reconcile, error_policy, ctx.clone())
    .for_each(log_reconcile_result("ExternalCluster"));

    tracing::info!("- ExternalControlPlane controller");
    let control_plane_ctrl = Controller::new(
        api::<ExternalControlPlane>(&client, ns),
        primary_watcher_config(filter.as_deref()),
    )
    .watches(
        api::<Cluster>(&client, ns),
        secondary_watcher_config(),
        dispatch(cluster_to_external_control_plane),
    )
    .with_config(runtime_config.clone())
    .shutdown_on_signal()
    .run(control_plane::reconcile, error_policy, ctx.clone())
    .for_each(log_reconcile_result("ExternalControlPlane"));

    tracing::info!("- ExternalMachine controller");
    let machine_ctrl = Controller::new(
        api::<ExternalMachine>(&client, ns),
        primary_watcher_config(filter.as_deref()),
    )
    .watches(
        api::<Machine>(&client, ns),
        secondary_watcher_config(),
        dispatch(machine_to_external_machine),
    )
    .with_config(runtime_config)
    .shutdown_on_signal()
    .run(machine::reconcile, error_policy, ctx)
    .for_each(log_reconcile_result("ExternalMachine"));

    vec![
        Box::pin(cluster_ctrl),
        Box::pin(control_plane_ctrl),
        Box::pin(machine_ctrl),
    ]
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
