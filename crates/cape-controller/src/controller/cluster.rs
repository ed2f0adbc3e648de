//! ExternalCluster controller
//!
//! Keeps the Machine inventory of an adopted cluster in step with its
//! nodes and reports whether the cluster is usable.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument};

use cape_common::crd::{Cluster, ExternalCluster};
use cape_common::kube_utils::{add_finalizer, remove_finalizer};
use cape_common::{Error, CLUSTER_FINALIZER};

use super::{without_owner, Context};
use crate::health::{derive_ready, CLUSTER_CHECKS};
use crate::ownership::{is_paused, matches_watch_filter, owner_cluster};
use crate::scope::ClusterScope;
use crate::sync::Synchronizer;

/// Reconcile an ExternalCluster
#[instrument(skip(ec, ctx), fields(external_cluster = %ec.name_any(), namespace = ?ec.namespace()))]
pub async fn reconcile(ec: Arc<ExternalCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(cluster) = owner_cluster(ctx.kube.as_ref(), ec.meta()).await? else {
        debug!("Cluster controller has not yet set OwnerRef");
        return without_owner(ec.as_ref(), CLUSTER_FINALIZER, &ctx).await;
    };
    if !matches_watch_filter(ec.meta(), ctx.config.watch_filter.as_deref()) {
        debug!("Outside the watch filter");
        return Ok(Action::await_change());
    }
    if is_paused(&cluster, ec.meta()) {
        info!(cluster = %cluster.name_any(), "Reconciliation is paused for this object");
        return Ok(Action::await_change());
    }

    let mut scope = ClusterScope::open((*ec).clone(), ctx.kube.clone())?;
    let result = if cluster.is_deleting() || ec.meta().deletion_timestamp.is_some() {
        reconcile_delete(&mut scope)
    } else {
        reconcile_normal(&mut scope, &cluster, &ctx).await
    };
    scope.finish(result).await
}

async fn reconcile_normal(
    scope: &mut ClusterScope,
    cluster: &Cluster,
    ctx: &Context,
) -> Result<Action, Error> {
    if add_finalizer(scope.meta_mut(), CLUSTER_FINALIZER) {
        debug!("Adding finalizer");
    }

    let synchronizer = Synchronizer::new(
        ctx.kube.as_ref(),
        ctx.remote.as_ref(),
        ctx.config.stale_machine_grace,
    );
    let namespace = scope.namespace().to_string();
    let status = scope.status_mut();
    let outcome = synchronizer
        .sync(&namespace, cluster, &mut status.conditions)
        .await;

    let readiness = derive_ready(&mut status.conditions, CLUSTER_CHECKS);
    status.ready = readiness.ready;
    status.failure_reason = readiness.failure_reason;
    status.failure_message = readiness.failure_message;

    let report = outcome?;
    debug!(nodes = report.nodes, created = report.created, stale = report.stale.len(), "Cluster synchronized");
    Ok(Action::requeue(ctx.config.sync_period))
}

/// Nothing was provisioned outside the management cluster; owner
/// references cascade the Machines away once the Cluster is gone
fn reconcile_delete(scope: &mut ClusterScope) -> Result<Action, Error> {
    if remove_finalizer(scope.meta_mut(), CLUSTER_FINALIZER) {
        info!("Releasing ExternalCluster");
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CreateOutcome, MockKubeClient, Subresource};
    use crate::controller::testing::*;
    use crate::controller::ControllerConfig;
    use crate::health::fixtures::node;
    use crate::remote::MockRemoteConnector;
    use cape_common::crd::ExternalClusterSpec;
    use cape_common::PAUSED_ANNOTATION;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn external_cluster() -> ExternalCluster {
        let mut ec = ExternalCluster::new("edge-01", ExternalClusterSpec::default());
        ec.metadata.namespace = Some("default".to_string());
        ec.metadata.resource_version = Some("1".to_string());
        ec.metadata.owner_references = Some(vec![owner_ref("Cluster", "edge-01")]);
        ec
    }

    fn ctx(client: MockKubeClient, connector: MockRemoteConnector) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(client), Arc::new(connector)))
    }

    mod gate {
        use super::*;

        /// Story: an ExternalCluster created before cluster-api links it
        ///
        /// Without an owner reference there is nothing to reconcile. The
        /// pass succeeds quietly and writes nothing; the owner reference
        /// being set later triggers a new pass.
        #[tokio::test]
        async fn story_unowned_cluster_is_left_alone() {
            // no expectations: any store call would panic
            let mut ec = external_cluster();
            ec.metadata.owner_references = None;

            let action = reconcile(Arc::new(ec), ctx(MockKubeClient::new(), MockRemoteConnector::new()))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn owner_that_no_longer_exists_is_pending() {
            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(None));
            client.expect_patch_object().never();

            let action = reconcile(Arc::new(external_cluster()), ctx(client, MockRemoteConnector::new()))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }

        /// Story: the Cluster was force-removed while its ExternalCluster
        /// was terminating
        ///
        /// No owner event will ever come, so the finalizer is released
        /// without resolving the owner and the resource can go away.
        #[tokio::test]
        async fn story_orphaned_deleting_cluster_is_released() {
            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(None));
            client.expect_get_secret().never();
            let recorded = record_patches(&mut client);

            let mut ec = external_cluster();
            ec.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
            ec.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            let action = reconcile(Arc::new(ec), ctx(client, MockRemoteConnector::new()))
                .await
                .unwrap();

            assert_eq!(action, Action::await_change());
            let patches = recorded.lock().unwrap();
            assert_eq!(patches.len(), 1);
            assert_eq!(patches[0].0, Subresource::Main);
            assert!(patches[0].1.as_array().unwrap().contains(&json!({
                "op": "remove",
                "path": "/metadata/finalizers"
            })));
        }

        #[tokio::test]
        async fn deleting_cluster_in_another_shard_is_not_released() {
            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(None));
            client.expect_patch_object().never();

            let mut ec = external_cluster();
            ec.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
            ec.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            let mut ctx = Context::for_testing(Arc::new(client), Arc::new(MockRemoteConnector::new()));
            ctx.config.watch_filter = Some("shard-a".to_string());
            let action = reconcile(Arc::new(ec), Arc::new(ctx)).await.unwrap();
            assert_eq!(action, Action::await_change());
        }

        /// Story: an operator pauses the Cluster during maintenance
        ///
        /// Neither branch runs: the credential is not read, the external
        /// cluster is not contacted, and status is not written.
        #[tokio::test]
        async fn story_paused_cluster_is_not_touched() {
            let mut client = MockKubeClient::new();
            client
                .expect_get_cluster()
                .returning(|_, _| Ok(Some(paused_cluster())));
            client.expect_get_secret().never();
            client.expect_patch_object().never();

            let action = reconcile(Arc::new(external_cluster()), ctx(client, MockRemoteConnector::new()))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn pause_annotation_on_the_resource_is_honored() {
            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(Some(cluster())));
            client.expect_patch_object().never();

            let mut ec = external_cluster();
            ec.metadata.annotations = Some(BTreeMap::from([(
                PAUSED_ANNOTATION.to_string(),
                String::new(),
            )]));
            let action = reconcile(Arc::new(ec), ctx(client, MockRemoteConnector::new()))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn other_shards_are_skipped() {
            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(Some(cluster())));
            client.expect_patch_object().never();

            let mut ctx = Context::for_testing(Arc::new(client), Arc::new(MockRemoteConnector::new()));
            ctx.config.watch_filter = Some("shard-a".to_string());
            let action = reconcile(Arc::new(external_cluster()), Arc::new(ctx))
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    mod lifecycle {
        use super::*;

        /// Story: the Cluster exists but nobody stored its credential
        ///
        /// The pass fails at the first check and the failure is visible
        /// on status before the error reaches the error policy.
        #[tokio::test]
        async fn story_missing_credential_marks_cluster_not_ready() {
            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(Some(cluster())));
            client.expect_get_secret().returning(|_, _| Ok(None));
            let recorded = record_patches(&mut client);

            let err = reconcile(Arc::new(external_cluster()), ctx(client, MockRemoteConnector::new()))
                .await
                .unwrap_err();

            assert_eq!(err.reason(), Some("KubeconfigSecretNotFound"));
            let status = last_status(&recorded).unwrap();
            assert_eq!(status["ready"], false);
            assert_eq!(status["failureReason"], "KubeconfigSecretNotFound");
            assert!(status["failureMessage"]
                .as_str()
                .unwrap()
                .contains("edge-01-kubeconfig"));
        }

        /// Story: a reachable cluster with two nodes becomes ready
        ///
        /// One pass creates a Machine and an ExternalMachine for each node,
        /// holds the finalizer, and reports ready with every check true.
        #[tokio::test]
        async fn story_two_nodes_are_mirrored_and_cluster_is_ready() {
            let created = Arc::new(Mutex::new(Vec::<String>::new()));

            let mut client = MockKubeClient::new();
            client.expect_get_cluster().returning(|_, _| Ok(Some(cluster())));
            client
                .expect_get_secret()
                .returning(|_, _| Ok(Some(kubeconfig_secret())));
            let sink = created.clone();
            client.expect_create_machine().returning(move |m| {
                sink.lock().unwrap().push(format!("Machine/{}", m.name_any()));
                Ok(CreateOutcome::Created)
            });
            let sink = created.clone();
            client.expect_create_external_machine().returning(move |m| {
                sink.lock().unwrap().push(format!("ExternalMachine/{}", m.name_any()));
                Ok(CreateOutcome::Created)
            });
            client.expect_list_mirrored_machines().returning(|_, _| Ok(vec![]));
            let recorded = record_patches(&mut client);
            let connector = healthy_remote(vec![node("n1", true), node("n2", true)], "v1.32.1");

            let action = reconcile(Arc::new(external_cluster()), ctx(client, connector))
                .await
                .unwrap();

            assert_eq!(action, Action::requeue(ControllerConfig::default().sync_period));
            assert_eq!(
                *created.lock().unwrap(),
                vec!["Machine/n1", "ExternalMachine/n1", "Machine/n2", "ExternalMachine/n2"]
            );
            assert_eq!(metadata_write(&recorded, "finalizers"), Some(json!([CLUSTER_FINALIZER])));
            let status = last_status(&recorded).unwrap();
            assert_eq!(status["ready"], true);
            assert!(status.get("failureReason").is_none());
            let ready = status["conditions"]
                .as_array()
                .unwrap()
                .iter()
                .find(|c| c["type"] == "Ready")
                .unwrap()
                .clone();
            assert_eq!(ready["status"], "True");
        }

        #[tokio::test]
        async fn deleting_cluster_releases_the_finalizer() {
            let mut client = MockKubeClient::new();
            client
                .expect_get_cluster()
                .returning(|_, _| Ok(Some(deleting_cluster())));
            client.expect_get_secret().never();
            let recorded = record_patches(&mut client);

            let mut ec = external_cluster();
            ec.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
            let action = reconcile(Arc::new(ec), ctx(client, MockRemoteConnector::new()))
                .await
                .unwrap();

            assert_eq!(action, Action::await_change());
            let patches = recorded.lock().unwrap();
            assert_eq!(patches.len(), 1);
            assert_eq!(patches[0].0, Subresource::Main);
            assert!(patches[0].1.as_array().unwrap().contains(&json!({
                "op": "remove",
                "path": "/metadata/finalizers"
            })));
        }
    }
}
