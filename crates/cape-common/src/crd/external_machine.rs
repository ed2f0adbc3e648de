//! ExternalMachine CRD: one per node of an adopted cluster

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, MachineAddress};

/// ExternalMachine mirrors a single node of an external cluster. It is
/// created by the cluster controller and named after the node.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ExternalMachine",
    namespaced,
    status = "ExternalMachineStatus",
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
pub struct ExternalMachineSpec {
    /// Provider ID reported by the node
    #[serde(rename = "providerID", default, skip_serializing_if = "String::is_empty")]
    pub provider_id: String,
}

/// ExternalMachine status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExternalMachineStatus {
    /// The node exists and reports Ready
    #[serde(default)]
    pub ready: bool,

    /// Named health checks, plus the derived Ready condition
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Addresses reported by the node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_uses_kubernetes_casing() {
        let spec = ExternalMachineSpec {
            provider_id: "aws:///us-east-1a/i-0abc".to_string(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["providerID"], "aws:///us-east-1a/i-0abc");
    }
}
