//! Custom Resource Definitions for the external cluster provider
//!
//! `ExternalCluster`, `ExternalControlPlane`, and `ExternalMachine` are owned
//! by this provider. `Cluster` and `Machine` are the subsets of the generic
//! cluster-api resources the provider reads and creates.

mod capi;
mod external_cluster;
mod external_control_plane;
mod external_machine;
mod types;

pub use capi::{Bootstrap, Cluster, ClusterSpec, ClusterStatus, Machine, MachineSpec};
pub use external_cluster::{ExternalCluster, ExternalClusterSpec, ExternalClusterStatus};
pub use external_control_plane::{
    ExternalControlPlane, ExternalControlPlaneSpec, ExternalControlPlaneStatus,
};
pub use external_machine::{ExternalMachine, ExternalMachineSpec, ExternalMachineStatus};
pub use types::{
    ApiEndpoint, Condition, ConditionSeverity, ConditionStatus, MachineAddress, ObjectReference,
};
