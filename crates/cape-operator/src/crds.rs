//! CRD manifests for the provider's own resources

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use cape_common::crd::{ExternalCluster, ExternalControlPlane, ExternalMachine};

/// Contract label cluster-api uses to pick the served version of a
/// provider CRD
pub const CONTRACT_LABEL: &str = "cluster.x-k8s.io/v1beta1";

/// The ExternalCluster, ExternalControlPlane, and ExternalMachine CRDs,
/// labelled with the contract version
pub fn provider_crds() -> Vec<CustomResourceDefinition> {
    [ExternalCluster::crd(), ExternalControlPlane::crd(), ExternalMachine::crd()]
        .into_iter()
        .map(|mut crd| {
            crd.metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(CONTRACT_LABEL.to_string(), "v1beta1".to_string());
            crd
        })
        .collect()
}

/// All provider CRDs as one multi-document YAML stream
pub fn render_crds() -> Result<String, serde_yaml::Error> {
    let documents = provider_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(documents.join("---\n"))
}
