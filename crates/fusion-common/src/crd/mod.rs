//! Custom Resource Definitions for Fusion Access
//!
//! `FusionAccess` is the only CRD this operator owns. The remaining types
//! describe objects served by other operators on the platform.

mod cluster_version;
pub mod external;
mod fusion_access;

pub use cluster_version::{
    ClusterVersion, ClusterVersionSpec, ClusterVersionStatus, Release, UpdateHistory,
    UpdateState, CLUSTER_VERSION_NAME,
};
pub use external::{
    ConsoleOperatorConfig, ConsolePlugin, LocalVolumeDiscovery, MachineConfig, MachineConfigPool,
    ScaleCluster,
};
pub use fusion_access::{
    BackingClusterSpec, DiscoveryAgentSpec, FusionAccess, FusionAccessSpec, FusionAccessStatus,
    ImagePullCheck, KernelConfigSpec, DEFAULT_MACHINE_CONFIG_POOL, MACHINE_CONFIG_ROLE_LABEL,
    STORAGE_ROLE_LABEL, STORAGE_ROLE_VALUE,
};
