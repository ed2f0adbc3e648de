//! ExternalMachine controller
//!
//! An ExternalMachine is ready when the node it mirrors exists on the
//! external cluster and reports Ready. Its addresses follow the node.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use cape_common::conditions;
use cape_common::crd::{ExternalMachine, ExternalMachineStatus};
use cape_common::kube_utils::{add_finalizer, remove_finalizer};
use cape_common::{Error, MACHINE_FINALIZER};

use super::{without_owner, Context};
use crate::health::{
    self, derive_ready, reasons, CheckFailure, KUBECONFIG_AVAILABLE, MACHINE_CHECKS, NODE_HEALTHY,
};
use crate::ownership::{cluster_name_label, is_paused, matches_watch_filter, owner_machine};
use crate::scope::MachineScope;

/// Reconcile an ExternalMachine
#[instrument(skip(em, ctx), fields(external_machine = %em.name_any(), namespace = ?em.namespace()))]
pub async fn reconcile(em: Arc<ExternalMachine>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(machine) = owner_machine(ctx.kube.as_ref(), em.meta()).await? else {
        debug!("Machine controller has not yet set OwnerRef");
        return without_owner(em.as_ref(), MACHINE_FINALIZER, &ctx).await;
    };
    let Some(cluster_name) = cluster_name_label(machine.meta()) else {
        debug!(machine = %machine.name_any(), "Machine is missing cluster label or cluster does not exist");
        return without_owner(em.as_ref(), MACHINE_FINALIZER, &ctx).await;
    };
    let namespace = machine.namespace().unwrap_or_default();
    let Some(cluster) = ctx.kube.get_cluster(&namespace, cluster_name).await? else {
        debug!(cluster = %cluster_name, "Cluster of the owning Machine does not exist yet");
        return without_owner(em.as_ref(), MACHINE_FINALIZER, &ctx).await;
    };
    if !matches_watch_filter(em.meta(), ctx.config.watch_filter.as_deref()) {
        debug!("Outside the watch filter");
        return Ok(Action::await_change());
    }
    if is_paused(&cluster, em.meta()) {
        info!(cluster = %cluster.name_any(), "Reconciliation is paused for this object");
        return Ok(Action::await_change());
    }

    let mut scope = MachineScope::open((*em).clone(), ctx.kube.clone())?;
    let deleting = machine.is_deleting() || cluster.is_deleting() || em.meta().deletion_timestamp.is_some();
    let result = if deleting {
        reconcile_delete(&mut scope)
    } else {
        reconcile_normal(&mut scope, &cluster.name_any(), &ctx).await
    };
    scope.finish(result).await
}

async fn reconcile_normal(
    scope: &mut MachineScope,
    cluster_name: &str,
    ctx: &Context,
) -> Result<Action, Error> {
    add_finalizer(scope.meta_mut(), MACHINE_FINALIZER);

    let namespace = scope.namespace().to_string();
    let node_name = scope.name().to_string();
    let status = scope.status_mut();

    let outcome = check_node(ctx, &namespace, cluster_name, &node_name, status).await;
    if let Err(failure) = &outcome {
        warn!(
            node = %node_name,
            check = failure.check,
            reason = failure.reason,
            message = %failure.message,
            "Node health check failed"
        );
        failure.record(&mut status.conditions, MACHINE_CHECKS);
    }

    let readiness = derive_ready(&mut status.conditions, MACHINE_CHECKS);
    status.ready = readiness.ready;

    outcome?;
    Ok(Action::requeue(ctx.config.sync_period))
}

/// Look up the mirrored node, refresh addresses, and check its readiness
async fn check_node(
    ctx: &Context,
    namespace: &str,
    cluster_name: &str,
    node_name: &str,
    status: &mut ExternalMachineStatus,
) -> Result<(), CheckFailure> {
    let remote =
        health::open_remote(ctx.kube.as_ref(), ctx.remote.as_ref(), namespace, cluster_name)
            .await?;
    conditions::mark_true(&mut status.conditions, KUBECONFIG_AVAILABLE);

    let node = remote
        .get_node(node_name)
        .await
        .map_err(|e| CheckFailure::new(NODE_HEALTHY, reasons::CLUSTER_ACCESS_FAILED, e.to_string()))?
        .ok_or_else(|| {
            CheckFailure::new(
                NODE_HEALTHY,
                reasons::NODE_NOT_FOUND,
                format!("node {node_name} not found in cluster {cluster_name}"),
            )
        })?;

    status.addresses = health::node_addresses(&node);
    if !health::is_node_ready(&node) {
        return Err(CheckFailure::new(
            NODE_HEALTHY,
            reasons::NODE_NOT_READY,
            format!("node {node_name} does not report Ready"),
        ));
    }
    conditions::mark_true(&mut status.conditions, NODE_HEALTHY);
    Ok(())
}

fn reconcile_delete(scope: &mut MachineScope) -> Result<Action, Error> {
    if remove_finalizer(scope.meta_mut(), MACHINE_FINALIZER) {
        info!("Releasing ExternalMachine");
    }
    Ok(Action::await_change())
}
