//! Mirror an external cluster's node inventory as Machine/ExternalMachine pairs
//!
//! The [`Synchronizer`] runs inside the cluster controller. It only reads
//! the external API and only creates in the management cluster, so every
//! pass is safe to repeat.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use cape_common::conditions;
use cape_common::crd::{
    Bootstrap, Cluster, Condition, ConditionSeverity, ConditionStatus, ExternalMachine,
    ExternalMachineSpec, Machine, MachineSpec, ObjectReference,
};
use cape_common::kube_utils::label;
use cape_common::{
    Error, BOOTSTRAP_DATA_SECRET_PLACEHOLDER, CLUSTER_NAME_LABEL, EXTERNAL_NODE_LABEL,
    INFRASTRUCTURE_API_VERSION,
};

use crate::client::{CreateOutcome, KubeClient};
use crate::health::{
    self, reasons, CheckFailure, CLUSTER_CHECKS, CLUSTER_REACHABLE, KUBECONFIG_AVAILABLE,
    MACHINES_SYNCED, NODES_IN_SYNC,
};
use crate::remote::RemoteConnector;

/// What one synchronization pass observed and did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    /// Nodes listed on the external cluster
    pub nodes: usize,
    /// Machines and ExternalMachines written this pass
    pub created: usize,
    /// Mirrored Machines whose node is gone
    pub stale: Vec<String>,
}

/// Build the Machine and ExternalMachine mirroring `node`
///
/// Both are named after the node; `None` for a node without a name.
pub fn machine_pair(namespace: &str, cluster_name: &str, node: &Node) -> Option<(Machine, ExternalMachine)> {
    let node_name = node.metadata.name.as_deref().filter(|n| !n.is_empty())?;
    let provider_id = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.clone())
        .unwrap_or_default();

    let meta = ObjectMeta {
        name: Some(node_name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([
            (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
            (EXTERNAL_NODE_LABEL.to_string(), node_name.to_string()),
        ])),
        ..Default::default()
    };

    let mut machine = Machine::new(
        node_name,
        MachineSpec {
            cluster_name: cluster_name.to_string(),
            bootstrap: Bootstrap {
                config_ref: None,
                data_secret_name: Some(BOOTSTRAP_DATA_SECRET_PLACEHOLDER.to_string()),
            },
            infrastructure_ref: ObjectReference::new(
                INFRASTRUCTURE_API_VERSION,
                &ExternalMachine::kind(&()),
                node_name,
            ),
            version: health::kubelet_version(node),
            provider_id: Some(provider_id.clone()).filter(|p| !p.is_empty()),
        },
    );
    machine.metadata = meta.clone();

    let mut external = ExternalMachine::new(node_name, ExternalMachineSpec { provider_id });
    external.metadata = meta;

    Some((machine, external))
}

/// Node-to-Machine synchronization for one cluster
pub struct Synchronizer<'a> {
    client: &'a dyn KubeClient,
    connector: &'a dyn RemoteConnector,
    stale_grace: Duration,
}

impl<'a> Synchronizer<'a> {
    /// Create a synchronizer; stale Machines are reported as warnings once
    /// their node has been missing for `stale_grace`
    pub fn new(
        client: &'a dyn KubeClient,
        connector: &'a dyn RemoteConnector,
        stale_grace: Duration,
    ) -> Self {
        Self {
            client,
            connector,
            stale_grace,
        }
    }

    /// Run one pass, recording every check on `conditions`
    ///
    /// A failed check is recorded before the error is returned.
    pub async fn sync(
        &self,
        namespace: &str,
        cluster: &Cluster,
        conditions: &mut Vec<Condition>,
    ) -> Result<SyncReport, Error> {
        match self.run(namespace, cluster, conditions).await {
            Ok(report) => Ok(report),
            Err(failure) => {
                warn!(
                    cluster = %cluster.name_any(),
                    check = failure.check,
                    reason = failure.reason,
                    message = %failure.message,
                    "Cluster health check failed"
                );
                failure.record(conditions, CLUSTER_CHECKS);
                Err(failure.into())
            }
        }
    }

    async fn run(
        &self,
        namespace: &str,
        cluster: &Cluster,
        conditions: &mut Vec<Condition>,
    ) -> Result<SyncReport, CheckFailure> {
        let cluster_name = cluster.name_any();

        let (secret, raw) = health::fetch_kubeconfig(self.client, namespace, &cluster_name).await?;
        let unowned = secret
            .metadata
            .owner_references
            .as_ref()
            .is_none_or(|refs| refs.is_empty());
        if unowned {
            self.adopt_secret(namespace, &secret.name_any(), cluster).await?;
        }
        let remote = health::connect(self.connector, &raw).await?;
        conditions::mark_true(conditions, KUBECONFIG_AVAILABLE);

        remote.list_namespaces().await.map_err(|e| {
            CheckFailure::new(CLUSTER_REACHABLE, reasons::CLUSTER_ACCESS_FAILED, e.to_string())
        })?;
        conditions::mark_true(conditions, CLUSTER_REACHABLE);

        let nodes = remote.list_nodes().await.map_err(|e| {
            CheckFailure::new(MACHINES_SYNCED, reasons::NODES_LIST_FAILED, e.to_string())
        })?;

        let mut report = SyncReport {
            nodes: nodes.len(),
            ..Default::default()
        };
        for node in &nodes {
            let Some((machine, external)) = machine_pair(namespace, &cluster_name, node) else {
                warn!(cluster = %cluster_name, "Skipping node without a name");
                continue;
            };
            report.created += self.create(&machine.name_any(), self.client.create_machine(&machine)).await?;
            report.created += self
                .create(&external.name_any(), self.client.create_external_machine(&external))
                .await?;
        }
        conditions::mark_true(conditions, MACHINES_SYNCED);

        report.stale = self.record_stale(namespace, &cluster_name, &nodes, conditions).await;
        if report.created > 0 {
            info!(cluster = %cluster_name, nodes = report.nodes, created = report.created, "Mirrored external nodes");
        }
        Ok(report)
    }

    async fn adopt_secret(
        &self,
        namespace: &str,
        secret_name: &str,
        cluster: &Cluster,
    ) -> Result<(), CheckFailure> {
        let Some(owner) = cluster.controller_owner_ref(&()) else {
            warn!(
                cluster = %cluster.name_any(),
                secret = %secret_name,
                "Cluster has no uid, kubeconfig secret left without an owner"
            );
            return Ok(());
        };
        debug!(secret = %secret_name, "Setting the Cluster as owner of the kubeconfig secret");
        self.client
            .set_secret_owner(namespace, secret_name, owner)
            .await
            .map_err(|e| {
                CheckFailure::new(
                    KUBECONFIG_AVAILABLE,
                    reasons::KUBECONFIG_SECRET_UPDATE_FAILED,
                    e.to_string(),
                )
            })
    }

    async fn create<F>(&self, name: &str, create: F) -> Result<usize, CheckFailure>
    where
        F: std::future::Future<Output = Result<CreateOutcome, Error>>,
    {
        match create.await {
            Ok(CreateOutcome::Created) => Ok(1),
            Ok(CreateOutcome::AlreadyExists) => Ok(0),
            Err(e) => Err(CheckFailure::new(
                MACHINES_SYNCED,
                reasons::MACHINE_CREATE_FAILED,
                format!("failed to create {name}: {e}"),
            )),
        }
    }

    /// Compare mirrored Machines with live nodes and record NodesInSync
    ///
    /// Nothing is deleted. Missing nodes are reported at Info severity
    /// during the grace period and at Warning after it.
    async fn record_stale(
        &self,
        namespace: &str,
        cluster_name: &str,
        nodes: &[Node],
        conditions: &mut Vec<Condition>,
    ) -> Vec<String> {
        let machines = match self.client.list_mirrored_machines(namespace, cluster_name).await {
            Ok(machines) => machines,
            Err(e) => {
                warn!(cluster = %cluster_name, error = %e, "Failed to list mirrored machines");
                conditions::set(
                    conditions,
                    Condition::unknown(NODES_IN_SYNC, reasons::MACHINES_LIST_FAILED, e.to_string()),
                );
                return Vec::new();
            }
        };

        let stale = stale_machines(&machines, nodes);
        if stale.is_empty() {
            conditions::mark_true(conditions, NODES_IN_SYNC);
            return stale;
        }

        let missing_since = conditions::get(conditions, NODES_IN_SYNC)
            .filter(|c| c.status == ConditionStatus::False)
            .map(|c| c.last_transition_time)
            .unwrap_or_else(Utc::now);
        let overdue = chrono::Duration::from_std(self.stale_grace)
            .map(|grace| Utc::now() - missing_since > grace)
            .unwrap_or(false);
        let severity = if overdue {
            warn!(cluster = %cluster_name, machines = ?stale, "Mirrored machines outlived their nodes");
            ConditionSeverity::Warning
        } else {
            ConditionSeverity::Info
        };
        conditions::mark_false(
            conditions,
            NODES_IN_SYNC,
            reasons::NODES_MISSING,
            severity,
            format!("no node for machines: {}", stale.join(", ")),
        );
        stale
    }
}

/// Names of mirrored Machines whose node is not in `nodes`, sorted
pub fn stale_machines(machines: &[Machine], nodes: &[Node]) -> Vec<String> {
    let live: BTreeSet<&str> = nodes
        .iter()
        .filter_map(|n| n.metadata.name.as_deref())
        .collect();
    let mut stale: Vec<String> = machines
        .iter()
        .filter_map(|m| {
            let node = label(&m.metadata, EXTERNAL_NODE_LABEL).or(m.metadata.name.as_deref())?;
            (!live.contains(node)).then(|| m.name_any())
        })
        .collect();
    stale.sort();
    stale
}
