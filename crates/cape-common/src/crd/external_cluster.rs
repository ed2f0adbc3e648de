//! ExternalCluster CRD: the infrastructure side of an adopted cluster

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, Condition};

/// ExternalCluster describes an already-running cluster whose API endpoint
/// is reachable from the management cluster.
///
/// Example:
/// ```yaml
/// apiVersion: infrastructure.cluster.x-k8s.io/v1beta1
/// kind: ExternalCluster
/// metadata:
///   name: edge-01
///   namespace: default
/// spec:
///   controlPlaneEndpoint:
///     host: edge-01.example.com
///     port: 6443
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ExternalCluster",
    namespaced,
    status = "ExternalClusterStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.failureReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalClusterSpec {
    /// Endpoint of the external cluster's API server
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// PEM bundle used to verify the API server, when not in the kubeconfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// ExternalCluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalClusterStatus {
    /// The external cluster is reachable and its nodes are mirrored
    #[serde(default)]
    pub ready: bool,

    /// Reason of the failing check, when not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Message of the failing check, when not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Named health checks, plus the derived Ready condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn crd_is_namespaced_in_infrastructure_group() {
        let crd = ExternalCluster::crd();
        assert_eq!(crd.spec.group, "infrastructure.cluster.x-k8s.io");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "ExternalCluster");
    }

    #[test]
    fn spec_round_trips_camel_case() {
        let spec: ExternalClusterSpec = serde_json::from_value(serde_json::json!({
            "controlPlaneEndpoint": {"host": "10.0.0.1", "port": 6443},
            "caBundle": "-----BEGIN CERTIFICATE-----"
        }))
        .unwrap();
        assert_eq!(spec.control_plane_endpoint.port, 6443);
        assert!(spec.ca_bundle.is_some());
    }

    #[test]
    fn empty_status_serializes_ready_only() {
        let json = serde_json::to_value(ExternalClusterStatus::default()).unwrap();
        assert_eq!(json, serde_json::json!({"ready": false}));
    }
}
