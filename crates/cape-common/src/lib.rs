//! Common types for the external cluster provider: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod leader_election;
pub mod retry;

pub use error::Error;

/// API group of the generic Cluster and Machine resources
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// API group of ExternalCluster and ExternalMachine
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster.x-k8s.io";

/// API version of ExternalCluster and ExternalMachine
pub const INFRASTRUCTURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// API group of ExternalControlPlane
pub const CONTROL_PLANE_GROUP: &str = "controlplane.cluster.x-k8s.io";

/// API version of ExternalControlPlane
pub const CONTROL_PLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1beta1";

/// Label carrying the owning Cluster's name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking Machines that mirror a node of an external cluster
pub const EXTERNAL_NODE_LABEL: &str = "infrastructure.cluster.x-k8s.io/external-node";

/// Label used to shard reconciliation between controller instances
pub const WATCH_FILTER_LABEL: &str = "cluster.x-k8s.io/watch-filter";

/// Annotation that halts reconciliation of a resource
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Finalizer held on ExternalCluster resources
pub const CLUSTER_FINALIZER: &str = "externalcluster.infrastructure.cluster.x-k8s.io";

/// Finalizer held on ExternalControlPlane resources
pub const CONTROL_PLANE_FINALIZER: &str = "external.controlplane.cluster.x-k8s.io";

/// Finalizer held on ExternalMachine resources
pub const MACHINE_FINALIZER: &str = "externalmachine.infrastructure.cluster.x-k8s.io";

/// Secret type used for cluster credentials
pub const CLUSTER_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";

/// Key under which the kubeconfig is stored in the credential secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Bootstrap data secret placeholder for mirrored Machines
///
/// Mirrored nodes are already running, so there is nothing to bootstrap.
pub const BOOTSTRAP_DATA_SECRET_PLACEHOLDER: &str = "non-existent-secret";

/// Name of the credential secret for a cluster
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-kubeconfig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kubeconfig_secret_follows_cluster_name() {
        assert_eq!(kubeconfig_secret_name("prod"), "prod-kubeconfig");
    }

    #[test]
    fn api_versions_match_groups() {
        assert!(INFRASTRUCTURE_API_VERSION.starts_with(INFRASTRUCTURE_GROUP));
        assert!(CONTROL_PLANE_API_VERSION.starts_with(CONTROL_PLANE_GROUP));
    }
}
