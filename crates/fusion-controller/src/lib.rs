//! FusionAccess controller
//!
//! Reconciles the singleton FusionAccess resource into a running Storage
//! Scale installation: version gate, image-pull probe, kernel configuration,
//! operator manifests, pull-secret propagation, console plugin, discovery
//! agent, and the backing Storage Scale cluster.

#![deny(missing_docs)]

pub mod backing_cluster;
pub mod client;
pub mod console;
pub mod controller;
pub mod discovery;
pub mod kernel;
pub mod manifests;
pub mod probe;
pub mod secrets;
pub mod steps;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, ControllerSettings};
