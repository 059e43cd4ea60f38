//! Start-up tasks run before the controller and webhook begin serving

mod crds;

pub use crds::{ensure_crds_installed, operator_crds};
