//! Access to an external cluster's own API
//!
//! The external API is only ever read. Every call is bounded by the
//! configured remote timeout so an unreachable cluster cannot stall a
//! reconcile worker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, ListParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;

use cape_common::kube_utils::client_from_kubeconfig;
use cape_common::Error;

/// Read-only view of an external cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteCluster: Send + Sync {
    /// Probe reachability by listing namespaces
    async fn list_namespaces(&self) -> Result<(), Error>;

    /// List all nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Get a node by name, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Version reported by the API server (e.g., "v1.32.1")
    async fn server_version(&self) -> Result<String, Error>;
}

/// Opens [`RemoteCluster`] clients from serialized kubeconfigs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Parse the kubeconfig and build a client; fails with
    /// [`Error::Kubeconfig`] when the credential is unusable
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn RemoteCluster>, Error>;
}

/// Connector backed by kube clients
pub struct KubeRemoteConnector {
    timeout: Duration,
}

impl KubeRemoteConnector {
    /// Create a connector whose clients bound each call by `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl RemoteConnector for KubeRemoteConnector {
    async fn connect(&self, kubeconfig: &[u8]) -> Result<Arc<dyn RemoteCluster>, Error> {
        let client = client_from_kubeconfig(kubeconfig, self.timeout).await?;
        Ok(Arc::new(RemoteClusterImpl {
            client,
            timeout: self.timeout,
        }))
    }
}

/// Remote cluster backed by a kube client
pub struct RemoteClusterImpl {
    client: Client,
    timeout: Duration,
}

impl RemoteClusterImpl {
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(Error::remote(operation, e.to_string())),
            Err(_) => Err(Error::remote(
                operation,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

#[async_trait]
impl RemoteCluster for RemoteClusterImpl {
    async fn list_namespaces(&self) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        self.bounded("list namespaces", api.list(&ListParams::default().limit(1)))
            .await?;
        Ok(())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = self
            .bounded("list nodes", api.list(&ListParams::default()))
            .await?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        self.bounded("get node", api.get_opt(name)).await
    }

    async fn server_version(&self) -> Result<String, Error> {
        let info = self
            .bounded("get server version", self.client.apiserver_version())
            .await?;
        Ok(info.git_version)
    }
}
