//! Mappers from watched Cluster and Machine events to the resources they
//! should wake up
//!
//! A malformed watched object is a typed error. [`dispatch`] logs it and
//! drops the event so one bad object cannot take a controller down.

use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use thiserror::Error;
use tracing::warn;

use cape_common::crd::{
    Cluster, ExternalCluster, ExternalControlPlane, ExternalMachine, Machine, ObjectReference,
};

use crate::ownership::is_paused;

/// A watched object could not be mapped to a request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchMapError {
    /// The watched object has no namespace
    #[error("{kind} {name} has no namespace")]
    MissingNamespace {
        /// Kind of the watched object
        kind: String,
        /// Name of the watched object
        name: String,
    },

    /// A reference of the expected kind has no name
    #[error("{field} of {kind} {name} has no name")]
    MissingRefName {
        /// Kind of the watched object
        kind: String,
        /// Name of the watched object
        name: String,
        /// The reference field (e.g., "spec.infrastructureRef")
        field: &'static str,
    },
}

/// Result of mapping one watched object
pub type MapResult<T> = Result<Option<ObjectRef<T>>, WatchMapError>;

fn request_for<W, T>(watched: &W, reference: Option<&ObjectReference>, field: &'static str) -> MapResult<T>
where
    W: Resource<DynamicType = ()>,
    T: Resource<DynamicType = ()>,
{
    let Some(reference) = reference.filter(|r| r.is_kind(&T::kind(&()))) else {
        return Ok(None);
    };
    let namespace = watched.namespace().ok_or_else(|| WatchMapError::MissingNamespace {
        kind: W::kind(&()).to_string(),
        name: watched.name_any(),
    })?;
    let name = reference
        .name
        .as_deref()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| WatchMapError::MissingRefName {
            kind: W::kind(&()).to_string(),
            name: watched.name_any(),
            field,
        })?;
    // references may point across namespaces
    let namespace = reference.namespace.clone().unwrap_or(namespace);
    Ok(Some(ObjectRef::new(name).within(&namespace)))
}

/// Cluster → its ExternalCluster, while the Cluster is not paused
pub fn cluster_to_external_cluster(cluster: &Cluster) -> MapResult<ExternalCluster> {
    if is_paused(cluster, &cluster.metadata) {
        return Ok(None);
    }
    request_for(cluster, cluster.spec.infrastructure_ref.as_ref(), "spec.infrastructureRef")
}

/// Cluster → its ExternalControlPlane, once the Cluster is unpaused and its
/// infrastructure is ready
pub fn cluster_to_external_control_plane(cluster: &Cluster) -> MapResult<ExternalControlPlane> {
    if is_paused(cluster, &cluster.metadata) || !cluster.infrastructure_ready() {
        return Ok(None);
    }
    request_for(cluster, cluster.spec.control_plane_ref.as_ref(), "spec.controlPlaneRef")
}

/// Machine → its ExternalMachine
pub fn machine_to_external_machine(machine: &Machine) -> MapResult<ExternalMachine> {
    request_for(
        machine,
        Some(&machine.spec.infrastructure_ref),
        "spec.infrastructureRef",
    )
}

/// Adapt a mapper for `Controller::watches`, logging and dropping errors
pub fn dispatch<W, T>(mapper: fn(&W) -> MapResult<T>) -> impl Fn(W) -> Option<ObjectRef<T>>
where
    W: Resource<DynamicType = ()>,
    T: Resource<DynamicType = ()>,
{
    move |watched| match mapper(&watched) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                kind = %W::kind(&()),
                name = %watched.name_any(),
                error = %e,
                "Dropping watch event"
            );
            None
        }
    }
}
