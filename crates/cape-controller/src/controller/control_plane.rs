//! ExternalControlPlane controller
//!
//! The control plane of an adopted cluster is not run by this provider, so
//! readiness comes from probing it: the API server must answer a version
//! call and enough nodes must report Ready.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};

use cape_common::conditions;
use cape_common::crd::{Cluster, ExternalControlPlane, ExternalControlPlaneStatus};
use cape_common::kube_utils::{add_finalizer, remove_finalizer};
use cape_common::{Error, CONTROL_PLANE_FINALIZER};

use super::{without_owner, Context};
use crate::health::{
    self, derive_ready, reasons, CheckFailure, API_SERVER_AVAILABLE, CONTROL_PLANE_CHECKS,
    KUBECONFIG_AVAILABLE, NODES_READY,
};
use crate::ownership::{is_paused, matches_watch_filter, owner_cluster};
use crate::scope::ControlPlaneScope;

/// Reconcile an ExternalControlPlane
#[instrument(skip(cp, ctx), fields(control_plane = %cp.name_any(), namespace = ?cp.namespace()))]
pub async fn reconcile(cp: Arc<ExternalControlPlane>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(cluster) = owner_cluster(ctx.kube.as_ref(), cp.meta()).await? else {
        debug!("Cluster controller has not yet set OwnerRef");
        return without_owner(cp.as_ref(), CONTROL_PLANE_FINALIZER, &ctx).await;
    };
    if !matches_watch_filter(cp.meta(), ctx.config.watch_filter.as_deref()) {
        debug!("Outside the watch filter");
        return Ok(Action::await_change());
    }
    if is_paused(&cluster, cp.meta()) {
        info!(cluster = %cluster.name_any(), "Reconciliation is paused for this object");
        return Ok(Action::await_change());
    }

    let mut scope = ControlPlaneScope::open((*cp).clone(), ctx.kube.clone())?;
    let result = if cluster.is_deleting() || cp.meta().deletion_timestamp.is_some() {
        reconcile_delete(&mut scope)
    } else {
        reconcile_normal(&mut scope, &cluster, &ctx).await
    };
    scope.finish(result).await
}

async fn reconcile_normal(
    scope: &mut ControlPlaneScope,
    cluster: &Cluster,
    ctx: &Context,
) -> Result<Action, Error> {
    add_finalizer(scope.meta_mut(), CONTROL_PLANE_FINALIZER);

    let namespace = scope.namespace().to_string();
    let generation = scope.resource().meta().generation;
    let status = scope.status_mut();
    status.observed_generation = generation;

    let outcome = probe(ctx, &namespace, &cluster.name_any(), status).await;
    if let Err(failure) = &outcome {
        warn!(
            check = failure.check,
            reason = failure.reason,
            message = %failure.message,
            "Control plane health check failed"
        );
        failure.record(&mut status.conditions, CONTROL_PLANE_CHECKS);
    }

    let readiness = derive_ready(&mut status.conditions, CONTROL_PLANE_CHECKS);
    status.ready = readiness.ready;
    status.failure_reason = readiness.failure_reason;
    status.failure_message = readiness.failure_message;

    outcome?;
    Ok(Action::requeue(ctx.config.sync_period))
}

/// Run the control-plane checks, recording each one that passes
///
/// `initialized` only ever goes from false to true.
async fn probe(
    ctx: &Context,
    namespace: &str,
    cluster_name: &str,
    status: &mut ExternalControlPlaneStatus,
) -> Result<(), CheckFailure> {
    let remote =
        health::open_remote(ctx.kube.as_ref(), ctx.remote.as_ref(), namespace, cluster_name)
            .await?;
    conditions::mark_true(&mut status.conditions, KUBECONFIG_AVAILABLE);

    let version = remote.server_version().await.map_err(|e| {
        CheckFailure::new(API_SERVER_AVAILABLE, reasons::API_SERVER_UNREACHABLE, e.to_string())
    })?;
    status.version = Some(version);
    if !status.initialized {
        info!("Control plane initialized");
        status.initialized = true;
    }
    conditions::mark_true(&mut status.conditions, API_SERVER_AVAILABLE);

    let nodes = remote.list_nodes().await.map_err(|e| {
        CheckFailure::new(NODES_READY, reasons::NODES_LIST_FAILED, e.to_string())
    })?;
    let ready = health::ready_node_count(&nodes);
    let required = ctx.config.min_ready_nodes;
    if ready < required {
        return Err(CheckFailure::new(
            NODES_READY,
            reasons::INSUFFICIENT_READY_NODES,
            format!("{ready} of {} nodes are Ready, {required} required", nodes.len()),
        ));
    }
    conditions::mark_true(&mut status.conditions, NODES_READY);
    Ok(())
}

fn reconcile_delete(scope: &mut ControlPlaneScope) -> Result<Action, Error> {
    if remove_finalizer(scope.meta_mut(), CONTROL_PLANE_FINALIZER) {
        info!("Releasing ExternalControlPlane");
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use crate::controller::testing::*;
    use crate::health::fixtures::node;
    use crate::remote::{MockRemoteCluster, MockRemoteConnector, RemoteCluster};
    use cape_common::crd::ExternalControlPlaneSpec;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use rstest::rstest;
    use serde_json::json;

    fn control_plane() -> ExternalControlPlane {
        let mut cp = ExternalControlPlane::new("edge-01", ExternalControlPlaneSpec {});
        cp.metadata.namespace = Some("default".to_string());
        cp.metadata.resource_version = Some("1".to_string());
        cp.metadata.generation = Some(3);
        cp.metadata.owner_references = Some(vec![owner_ref("Cluster", "edge-01")]);
        cp
    }

    fn healthy_store() -> MockKubeClient {
        let mut client = MockKubeClient::new();
        client.expect_get_cluster().returning(|_, _| Ok(Some(cluster())));
        client
            .expect_get_secret()
            .returning(|_, _| Ok(Some(kubeconfig_secret())));
        client
    }

    fn ctx(client: MockKubeClient, connector: MockRemoteConnector) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(client), Arc::new(connector)))
    }

    /// Story: readiness follows the external API, not a constant
    ///
    /// A control plane whose API server answers and whose nodes are Ready
    /// reports the server version, is initialized, and is ready.
    #[tokio::test]
    async fn story_healthy_control_plane_is_ready() {
        let mut client = healthy_store();
        let recorded = record_patches(&mut client);
        let connector = healthy_remote(vec![node("cp-1", true), node("w-1", false)], "v1.32.1");

        reconcile(Arc::new(control_plane()), ctx(client, connector))
            .await
            .unwrap();

        let status = last_status(&recorded).unwrap();
        assert_eq!(status["ready"], true);
        assert_eq!(status["initialized"], true);
        assert_eq!(status["version"], "v1.32.1");
        assert_eq!(status["observedGeneration"], 3);
        assert_eq!(
            metadata_write(&recorded, "finalizers"),
            Some(json!([CONTROL_PLANE_FINALIZER]))
        );
    }

    #[rstest]
    #[case::none_ready(vec![node("n1", false)], 1)]
    #[case::below_threshold(vec![node("n1", true), node("n2", false)], 2)]
    #[tokio::test]
    async fn too_few_ready_nodes_is_not_ready(#[case] nodes: Vec<Node>, #[case] min: usize) {
        let mut client = healthy_store();
        let recorded = record_patches(&mut client);
        let connector = healthy_remote(nodes, "v1.32.1");
        let mut ctx = Context::for_testing(Arc::new(client), Arc::new(connector));
        ctx.config.min_ready_nodes = min;

        let err = reconcile(Arc::new(control_plane()), Arc::new(ctx))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), Some(reasons::INSUFFICIENT_READY_NODES));
        let status = last_status(&recorded).unwrap();
        assert_eq!(status["ready"], false);
        // the API server did answer
        assert_eq!(status["initialized"], true);
        assert_eq!(status["failureReason"], reasons::INSUFFICIENT_READY_NODES);
    }

    #[tokio::test]
    async fn unreachable_api_server_keeps_initialized() {
        let mut client = healthy_store();
        let recorded = record_patches(&mut client);
        let mut connector = MockRemoteConnector::new();
        connector.expect_connect().returning(|_| {
            let mut remote = MockRemoteCluster::new();
            remote
                .expect_server_version()
                .returning(|| Err(Error::remote("get server version", "timed out after 10s")));
            Ok(Arc::new(remote) as Arc<dyn RemoteCluster>)
        });

        let mut cp = control_plane();
        cp.status = Some(ExternalControlPlaneStatus {
            initialized: true,
            ready: true,
            ..Default::default()
        });
        let err = reconcile(Arc::new(cp), ctx(client, connector))
            .await
            .unwrap_err();

        assert_eq!(err.reason(), Some(reasons::API_SERVER_UNREACHABLE));
        let status = last_status(&recorded).unwrap();
        assert_eq!(status["ready"], false);
        assert_eq!(status["initialized"], true);
        assert_eq!(status["failureReason"], reasons::API_SERVER_UNREACHABLE);
    }

    #[tokio::test]
    async fn missing_owner_writes_nothing() {
        let mut cp = control_plane();
        cp.metadata.owner_references = None;

        let action = reconcile(Arc::new(cp), ctx(MockKubeClient::new(), MockRemoteConnector::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deleting_control_plane_without_cluster_releases_the_finalizer() {
        let mut client = MockKubeClient::new();
        client.expect_get_cluster().returning(|_, _| Ok(None));
        let recorded = record_patches(&mut client);

        let mut cp = control_plane();
        cp.metadata.finalizers = Some(vec![CONTROL_PLANE_FINALIZER.to_string()]);
        cp.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let action = reconcile(Arc::new(cp), ctx(client, MockRemoteConnector::new()))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(metadata_write(&recorded, "finalizers"), Some(serde_json::Value::Null));
        assert!(last_status(&recorded).is_none());
    }

    #[tokio::test]
    async fn paused_cluster_skips_probing() {
        let mut client = MockKubeClient::new();
        client
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(paused_cluster())));
        client.expect_patch_object().never();

        let action = reconcile(Arc::new(control_plane()), ctx(client, MockRemoteConnector::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn deleting_cluster_releases_the_finalizer() {
        let mut client = MockKubeClient::new();
        client
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(deleting_cluster())));
        let recorded = record_patches(&mut client);

        let mut cp = control_plane();
        cp.metadata.finalizers = Some(vec![CONTROL_PLANE_FINALIZER.to_string()]);
        reconcile(Arc::new(cp), ctx(client, MockRemoteConnector::new()))
            .await
            .unwrap();

        assert_eq!(metadata_write(&recorded, "finalizers"), Some(serde_json::Value::Null));
        assert!(last_status(&recorded).is_none());
    }
}
