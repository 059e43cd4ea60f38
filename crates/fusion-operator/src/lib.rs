//! Fusion Access operator
//!
//! Wires the FusionAccess controller, CRD self-installation and the
//! validating admission webhook into one process.

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
pub mod startup;
pub mod webhook;
