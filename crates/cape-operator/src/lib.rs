//! Manager for the external cluster provider
//!
//! Library half of the `cape` binary: command line, controller wiring,
//! probes, CRD rendering, and the importer.

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod crds;
pub mod import;
pub mod probes;
