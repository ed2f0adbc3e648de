//! Reconcilers for ExternalCluster, ExternalControlPlane, and ExternalMachine
//!
//! All three share one gate, applied in order:
//!
//! 1. Resolve the owner(s). Until they exist nothing happens; the owner's
//!    own watch event re-triggers the resource. A resource that is being
//!    deleted is released instead, so it cannot outlive its owner.
//! 2. Skip objects outside this instance's watch-filter shard.
//! 3. Skip paused resources (Cluster `spec.paused`, or the pause annotation
//!    on the Cluster or the resource).
//! 4. Open a [`Scope`](crate::scope::Scope), run the delete or the normal
//!    branch, and close the scope.

pub mod cluster;
pub mod control_plane;
pub mod machine;

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use tracing::{error, info};

use cape_common::kube_utils::{has_finalizer, remove_finalizer};
use cape_common::Error;

use crate::client::{KubeClient, KubeClientImpl};
use crate::ownership::matches_watch_filter;
use crate::remote::{KubeRemoteConnector, RemoteConnector};
use crate::scope::Scope;

/// Requeue delay after a write conflict
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Tunables shared by the three controllers
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Periodic resync of healthy resources
    pub sync_period: Duration,
    /// Requeue delay after a transient failure
    pub error_requeue: Duration,
    /// Bound on each call against an external cluster
    pub remote_timeout: Duration,
    /// Nodes that must report Ready for a control plane to be ready
    pub min_ready_nodes: usize,
    /// How long a mirrored Machine may outlive its node before a warning
    pub stale_machine_grace: Duration,
    /// Only reconcile objects whose watch-filter label has this value
    pub watch_filter: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(600),
            error_requeue: Duration::from_secs(15),
            remote_timeout: Duration::from_secs(10),
            min_ready_nodes: 1,
            stale_machine_grace: Duration::from_secs(600),
            watch_filter: None,
        }
    }
}

/// Shared state handed to every reconcile
pub struct Context {
    /// Management cluster access (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Opens clients for external clusters
    pub remote: Arc<dyn RemoteConnector>,
    /// Tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, remote: Arc<dyn RemoteConnector>) -> Self {
        Self {
            kube,
            remote,
            config: ControllerConfig::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    remote: Option<Arc<dyn RemoteConnector>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            remote: None,
            config: ControllerConfig::default(),
        }
    }

    /// Set the controller tunables
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the management cluster client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the external cluster connector
    pub fn remote_connector(mut self, remote: Arc<dyn RemoteConnector>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        let timeout = self.config.remote_timeout;
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            remote: self
                .remote
                .unwrap_or_else(|| Arc::new(KubeRemoteConnector::new(timeout))),
            config: self.config,
        }
    }
}

/// Outcome of a pass whose owner could not be resolved
///
/// A live resource waits for its owner. A deleting one that still holds
/// `finalizer` has it removed, since no owner event will ever arrive.
pub(crate) async fn without_owner<K>(resource: &K, finalizer: &str, ctx: &Context) -> Result<Action, Error>
where
    K: Resource<DynamicType = ()> + Serialize + Clone,
{
    let meta = resource.meta();
    if meta.deletion_timestamp.is_none()
        || !has_finalizer(meta, finalizer)
        || !matches_watch_filter(meta, ctx.config.watch_filter.as_deref())
    {
        return Ok(Action::await_change());
    }

    info!("Owner is gone, releasing finalizer");
    let mut scope = Scope::open(resource.clone(), ctx.kube.clone())?;
    remove_finalizer(scope.meta_mut(), finalizer);
    scope.finish(Ok(Action::await_change())).await
}

/// Requeue policy for failed reconciles
///
/// Conflicts retry almost immediately from fresh state, transient failures
/// back off, and permanent ones wait for the next resync.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: ResourceExt,
{
    error!(
        error = %error,
        resource = %obj.name_any(),
        namespace = %obj.namespace().unwrap_or_default(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_conflict() {
        Action::requeue(CONFLICT_REQUEUE)
    } else if error.is_retryable() {
        Action::requeue(ctx.config.error_requeue)
    } else {
        Action::requeue(ctx.config.sync_period)
    }
}
