//! Reconcilers for externally provisioned clusters
//!
//! Three controllers drive the provider resources of an adopted cluster:
//!
//! - [`controller::cluster`] mirrors the external nodes as Machines and
//!   reports whether the cluster is reachable
//! - [`controller::control_plane`] probes the external API server and node
//!   readiness
//! - [`controller::machine`] tracks the health of one mirrored node
//!
//! Each pass works on a [`scope::Scope`], which persists metadata and status
//! changes once at the end of the pass.

#![deny(missing_docs)]

pub mod client;
pub mod controller;
pub mod health;
pub mod ownership;
pub mod remote;
pub mod scope;
pub mod sync;
pub mod watches;

pub use client::{KubeClient, KubeClientImpl};
pub use controller::{error_policy, Context, ContextBuilder, ControllerConfig};
pub use remote::{KubeRemoteConnector, RemoteCluster, RemoteConnector};
pub use sync::Synchronizer;
