//! API coordinates of objects owned by other operators
//!
//! These kinds are written as `DynamicObject`s; only their group, version and
//! kind are fixed here so every caller resolves the same `ApiResource`.

use crate::kube_utils::HasApiResource;

/// `MachineConfig` consumed by the machine-config operator
pub struct MachineConfig;

impl HasApiResource for MachineConfig {
    const API_VERSION: &'static str = "machineconfiguration.openshift.io/v1";
    const KIND: &'static str = "MachineConfig";
}

/// `MachineConfigPool` whose status reports rollout progress
pub struct MachineConfigPool;

impl HasApiResource for MachineConfigPool {
    const API_VERSION: &'static str = "machineconfiguration.openshift.io/v1";
    const KIND: &'static str = "MachineConfigPool";
}

/// `LocalVolumeDiscovery` served by the local-storage operator
pub struct LocalVolumeDiscovery;

impl HasApiResource for LocalVolumeDiscovery {
    const API_VERSION: &'static str = "local.storage.openshift.io/v1alpha1";
    const KIND: &'static str = "LocalVolumeDiscovery";
}

/// Storage Scale `Cluster` served by the Storage Scale operator
pub struct ScaleCluster;

impl HasApiResource for ScaleCluster {
    const API_VERSION: &'static str = "scale.spectrum.ibm.com/v1beta1";
    const KIND: &'static str = "Cluster";
}

/// Dynamic console plugin registration
pub struct ConsolePlugin;

impl HasApiResource for ConsolePlugin {
    const API_VERSION: &'static str = "console.openshift.io/v1";
    const KIND: &'static str = "ConsolePlugin";
}

/// Cluster console operator configuration (`consoles.operator.openshift.io`)
pub struct ConsoleOperatorConfig;

impl HasApiResource for ConsoleOperatorConfig {
    const API_VERSION: &'static str = "operator.openshift.io/v1";
    const KIND: &'static str = "Console";
}
