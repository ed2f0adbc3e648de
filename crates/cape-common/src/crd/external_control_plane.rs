//! ExternalControlPlane CRD: the control-plane side of an adopted cluster

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;

/// ExternalControlPlane stands in for a control plane this provider does
/// not run. It only reports what it observes through the external API.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ExternalControlPlane",
    namespaced,
    status = "ExternalControlPlaneStatus",
    shortname = "ncp",
    printcolumn = r#"{"name":"Initialized","type":"boolean","jsonPath":".status.initialized"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalControlPlaneSpec {}

/// ExternalControlPlane status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalControlPlaneStatus {
    /// Kubernetes version reported by the external API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The API server has answered at least once
    #[serde(default)]
    pub initialized: bool,

    /// All control-plane health checks pass
    #[serde(default)]
    pub ready: bool,

    /// Reason of the failing check, when not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    /// Message of the failing check, when not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// Generation last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Named health checks, plus the derived Ready condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
