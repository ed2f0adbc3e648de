//! Named health checks and readiness derivation
//!
//! Each check is recorded as a condition. Ready is the AND of a
//! controller's required checks, and the boolean `ready` field is
//! projected from Ready, never set directly.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Secret};

use cape_common::conditions::{self, WAITING_FOR_CHECK_REASON};
use cape_common::crd::{Condition, ConditionSeverity, MachineAddress};
use cape_common::{kubeconfig_secret_name, Error, KUBECONFIG_SECRET_KEY};

use crate::client::KubeClient;
use crate::remote::{RemoteCluster, RemoteConnector};

/// The credential secret exists, is owned by the Cluster, and parses
pub const KUBECONFIG_AVAILABLE: &str = "KubeconfigAvailable";
/// The external API answers
pub const CLUSTER_REACHABLE: &str = "ClusterReachable";
/// Every external node has a Machine and ExternalMachine
pub const MACHINES_SYNCED: &str = "MachinesSynced";
/// No mirrored Machine outlived its node (informational)
pub const NODES_IN_SYNC: &str = "NodesInSync";
/// The external API server reports its version
pub const API_SERVER_AVAILABLE: &str = "APIServerAvailable";
/// Enough external nodes report Ready
pub const NODES_READY: &str = "NodesReady";
/// The mirrored node exists and reports Ready
pub const NODE_HEALTHY: &str = "NodeHealthy";

/// Checks gating ExternalCluster readiness, in evaluation order
pub const CLUSTER_CHECKS: &[&str] = &[KUBECONFIG_AVAILABLE, CLUSTER_REACHABLE, MACHINES_SYNCED];
/// Checks gating ExternalControlPlane readiness, in evaluation order
pub const CONTROL_PLANE_CHECKS: &[&str] =
    &[KUBECONFIG_AVAILABLE, API_SERVER_AVAILABLE, NODES_READY];
/// Checks gating ExternalMachine readiness
pub const MACHINE_CHECKS: &[&str] = &[KUBECONFIG_AVAILABLE, NODE_HEALTHY];

/// Failure reasons recorded on conditions
pub mod reasons {
    /// The credential secret or its `value` key is missing
    pub const KUBECONFIG_SECRET_NOT_FOUND: &str = "KubeconfigSecretNotFound";
    /// The credential does not parse into a client
    pub const KUBECONFIG_INVALID: &str = "KubeconfigInvalid";
    /// The owner reference could not be written to the credential secret
    pub const KUBECONFIG_SECRET_UPDATE_FAILED: &str = "KubeconfigSecretUpdateFailed";
    /// Listing namespaces on the external API failed
    pub const CLUSTER_ACCESS_FAILED: &str = "ClusterAccessFailed";
    /// Listing nodes on the external API failed
    pub const NODES_LIST_FAILED: &str = "NodesListFailed";
    /// A Machine or ExternalMachine could not be created
    pub const MACHINE_CREATE_FAILED: &str = "MachineCreateFailed";
    /// Mirrored Machines exist for nodes that are gone
    pub const NODES_MISSING: &str = "NodesMissing";
    /// The stored Machines could not be listed
    pub const MACHINES_LIST_FAILED: &str = "MachinesListFailed";
    /// The API server version call failed
    pub const API_SERVER_UNREACHABLE: &str = "APIServerUnreachable";
    /// Fewer nodes report Ready than required
    pub const INSUFFICIENT_READY_NODES: &str = "InsufficientReadyNodes";
    /// The node named after the ExternalMachine does not exist
    pub const NODE_NOT_FOUND: &str = "NodeNotFound";
    /// The node exists but does not report Ready
    pub const NODE_NOT_READY: &str = "NodeNotReady";
}

/// A failed named check
#[derive(Clone, Debug, PartialEq)]
pub struct CheckFailure {
    /// Condition type of the check
    pub check: &'static str,
    /// Machine-readable reason
    pub reason: &'static str,
    /// How bad the failure is
    pub severity: ConditionSeverity,
    /// Human-readable detail
    pub message: String,
}

impl CheckFailure {
    /// A failure expected to clear up on its own
    pub fn new(check: &'static str, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            check,
            reason,
            severity: ConditionSeverity::Warning,
            message: message.into(),
        }
    }

    /// Override the severity
    pub fn with_severity(mut self, severity: ConditionSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Record the failure, and mark the checks evaluated after it unknown
    pub fn record(&self, conditions: &mut Vec<Condition>, checks: &[&str]) {
        conditions::mark_false(
            conditions,
            self.check,
            self.reason,
            self.severity,
            self.message.clone(),
        );
        let downstream = checks
            .iter()
            .skip_while(|c| **c != self.check)
            .skip(1);
        for check in downstream {
            conditions::set(
                conditions,
                Condition::unknown(
                    *check,
                    WAITING_FOR_CHECK_REASON,
                    format!("{} is failing", self.check),
                ),
            );
        }
    }
}

impl From<CheckFailure> for Error {
    fn from(failure: CheckFailure) -> Self {
        Error::health_check(failure.check, failure.reason, failure.message)
    }
}

/// Readiness projected from the Ready condition
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Readiness {
    /// Ready holds
    pub ready: bool,
    /// Reason of a false Ready
    pub failure_reason: Option<String>,
    /// Message of a false Ready
    pub failure_message: Option<String>,
}

/// Recompute Ready from `required` and project it
pub fn derive_ready(conditions: &mut Vec<Condition>, required: &[&str]) -> Readiness {
    let ready = conditions::update_ready(conditions, required);
    if ready.is_true() {
        Readiness {
            ready: true,
            ..Default::default()
        }
    } else {
        Readiness {
            ready: false,
            failure_reason: ready.reason,
            failure_message: ready.message,
        }
    }
}

/// Read the credential for `cluster_name`, returning the secret and the
/// serialized kubeconfig
pub async fn fetch_kubeconfig(
    client: &dyn KubeClient,
    namespace: &str,
    cluster_name: &str,
) -> Result<(Secret, Vec<u8>), CheckFailure> {
    let name = kubeconfig_secret_name(cluster_name);
    let secret = match client.get_secret(namespace, &name).await {
        Ok(Some(secret)) => secret,
        Ok(None) => {
            return Err(CheckFailure::new(
                KUBECONFIG_AVAILABLE,
                reasons::KUBECONFIG_SECRET_NOT_FOUND,
                format!("secret {namespace}/{name} not found"),
            ))
        }
        Err(e) => {
            return Err(CheckFailure::new(
                KUBECONFIG_AVAILABLE,
                reasons::KUBECONFIG_SECRET_NOT_FOUND,
                format!("failed to read secret {namespace}/{name}: {e}"),
            ))
        }
    };

    let value = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        .map(|v| v.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
                .map(|v| v.clone().into_bytes())
        })
        .filter(|v| !v.is_empty());

    match value {
        Some(raw) => Ok((secret, raw)),
        None => Err(CheckFailure::new(
            KUBECONFIG_AVAILABLE,
            reasons::KUBECONFIG_SECRET_NOT_FOUND,
            format!("secret {namespace}/{name} has no {KUBECONFIG_SECRET_KEY:?} key"),
        )),
    }
}

/// Build a remote client from a serialized kubeconfig
pub async fn connect(
    connector: &dyn RemoteConnector,
    kubeconfig: &[u8],
) -> Result<Arc<dyn RemoteCluster>, CheckFailure> {
    connector.connect(kubeconfig).await.map_err(|e| {
        CheckFailure::new(KUBECONFIG_AVAILABLE, reasons::KUBECONFIG_INVALID, e.to_string())
            .with_severity(ConditionSeverity::Error)
    })
}

/// Fetch the credential and connect in one step
pub async fn open_remote(
    client: &dyn KubeClient,
    connector: &dyn RemoteConnector,
    namespace: &str,
    cluster_name: &str,
) -> Result<Arc<dyn RemoteCluster>, CheckFailure> {
    let (_, raw) = fetch_kubeconfig(client, namespace, cluster_name).await?;
    connect(connector, &raw).await
}

/// True when the node's Ready condition is True
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

/// Number of nodes reporting Ready
pub fn ready_node_count(nodes: &[Node]) -> usize {
    nodes.iter().filter(|n| is_node_ready(n)).count()
}

/// Addresses reported by the node
pub fn node_addresses(node: &Node) -> Vec<MachineAddress> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .map(|addrs| {
            addrs
                .iter()
                .map(|a| MachineAddress {
                    type_: a.type_.clone(),
                    address: a.address.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Kubelet version reported by the node
pub fn kubelet_version(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|s| s.node_info.as_ref())
        .map(|i| i.kubelet_version.clone())
        .filter(|v| !v.is_empty())
}
