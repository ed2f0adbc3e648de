//! Admission webhook for the external cluster provider
//!
//! Machines that mirror nodes of an adopted cluster must not be deleted on
//! their own: cluster-api would drain and remove the real node. The
//! validating webhook in [`machine`] only lets them go while the whole
//! Cluster is being torn down.

#![deny(missing_docs)]

pub mod error;
pub mod machine;
pub mod server;

pub use error::WebhookError;
pub use machine::{ClusterLookup, KubeClusterLookup, WebhookState, MACHINE_VALIDATE_PATH};
pub use server::{serve, webhook_router, WebhookServerConfig};
