//! Subsets of the generic cluster-api Cluster and Machine resources
//!
//! These are read (Cluster) or created (Machine) by the provider; their
//! CRDs are installed by cluster-api itself, never by this crate.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, ObjectReference};

/// Top-level grouping of an adopted cluster's resources
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Stops reconciliation of the cluster and everything under it
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,

    /// Endpoint of the cluster's API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,

    /// The control-plane provider resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ObjectReference>,

    /// The infrastructure provider resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,
}

/// Cluster status (fields the provider reads)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// The infrastructure provider reports ready
    #[serde(default)]
    pub infrastructure_ready: bool,

    /// The control-plane provider reports ready
    #[serde(default)]
    pub control_plane_ready: bool,
}

/// Node placeholder in the orchestration system
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning Cluster
    pub cluster_name: String,

    /// How the machine is bootstrapped
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// The infrastructure provider resource backing this machine
    pub infrastructure_ref: ObjectReference,

    /// Kubernetes version of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Provider ID of the node
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Bootstrap configuration of a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Bootstrap config provider resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Secret holding already-rendered bootstrap data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

impl Cluster {
    /// True once the orchestration system has started deleting the cluster
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True once the infrastructure provider reported ready
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.infrastructure_ready)
            .unwrap_or(false)
    }
}

impl Machine {
    /// True once the orchestration system has started deleting the machine
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_parses_refs_and_ignores_unknown_fields() {
        let cluster: Cluster = serde_json::from_value(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": {"name": "edge-01", "namespace": "default"},
            "spec": {
                "clusterNetwork": {"pods": {"cidrBlocks": ["10.0.0.0/16"]}},
                "controlPlaneRef": {
                    "apiVersion": "controlplane.cluster.x-k8s.io/v1beta1",
                    "kind": "ExternalControlPlane",
                    "name": "edge-01"
                },
                "infrastructureRef": {
                    "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
                    "kind": "ExternalCluster",
                    "name": "edge-01"
                }
            },
            "status": {"infrastructureReady": true, "phase": "Provisioned"}
        }))
        .unwrap();

        assert!(!cluster.spec.paused);
        assert!(cluster.infrastructure_ready());
        assert!(!cluster.is_deleting());
        let cp = cluster.spec.control_plane_ref.unwrap();
        assert!(cp.is_kind("ExternalControlPlane"));
    }

    #[test]
    fn machine_serializes_provider_fields() {
        let machine = Machine::new(
            "node-a",
            MachineSpec {
                cluster_name: "edge-01".to_string(),
                bootstrap: Bootstrap {
                    config_ref: None,
                    data_secret_name: Some("non-existent-secret".to_string()),
                },
                infrastructure_ref: ObjectReference::new(
                    "infrastructure.cluster.x-k8s.io/v1beta1",
                    "ExternalMachine",
                    "node-a",
                ),
                version: Some("v1.32.1".to_string()),
                provider_id: Some("kind://docker/edge/node-a".to_string()),
            },
        );
        let json = serde_json::to_value(&machine).unwrap();
        assert_eq!(json["spec"]["clusterName"], "edge-01");
        assert_eq!(json["spec"]["providerID"], "kind://docker/edge/node-a");
        assert_eq!(
            json["spec"]["bootstrap"]["dataSecretName"],
            "non-existent-secret"
        );
        assert_eq!(json["spec"]["infrastructureRef"]["kind"], "ExternalMachine");
    }
}
