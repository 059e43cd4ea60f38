//! FusionAccess CRD
//!
//! The single desired-state resource for a Storage Scale installation. At
//! most one may exist in the cluster; the admission webhook rejects a second
//! create and the controller only acts on the oldest instance.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Node role label the MachineConfig targets when no selector is given
pub const MACHINE_CONFIG_ROLE_LABEL: &str = "machineconfiguration.openshift.io/role";

/// Default pool that receives the kernel configuration
pub const DEFAULT_MACHINE_CONFIG_POOL: &str = "worker";

/// Label marking nodes that run Storage Scale daemons
pub const STORAGE_ROLE_LABEL: &str = "scale.spectrum.ibm.com/role";

/// Value of [`STORAGE_ROLE_LABEL`] for storage nodes
pub const STORAGE_ROLE_VALUE: &str = "storage";

/// FusionAccess declares the wanted Storage Scale installation.
///
/// Example:
/// ```yaml
/// apiVersion: fusion.storage.openshift.io/v1alpha1
/// kind: FusionAccess
/// metadata:
///   name: fusionaccess-object
///   namespace: ibm-fusion-access
/// spec:
///   productVersion: "5.2.2.0"
///   kernelConfig:
///     enabled: true
///   discoveryAgent:
///     enabled: true
///   backingCluster:
///     enabled: true
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fusion.storage.openshift.io",
    version = "v1alpha1",
    kind = "FusionAccess",
    namespaced,
    status = "FusionAccessStatus",
    shortname = "fa",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.productVersion"}"#,
    printcolumn = r#"{"name":"ImagePull","type":"string","jsonPath":".status.imagePullCheck"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FusionAccessSpec {
    /// Declared Storage Scale version (major.minor.patch.build)
    pub product_version: String,

    /// Kernel configuration rolled out to nodes before installation
    #[serde(default)]
    pub kernel_config: KernelConfigSpec,

    /// Local device discovery agent
    #[serde(default)]
    pub discovery_agent: DiscoveryAgentSpec,

    /// Storage Scale cluster object backing the installation
    #[serde(default)]
    pub backing_cluster: BackingClusterSpec,
}

/// Kernel configuration settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KernelConfigSpec {
    /// Create the MachineConfig and wait for its rollout
    #[serde(default)]
    pub enabled: bool,

    /// Labels put on the MachineConfig; they select the pool it lands in
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
}

impl KernelConfigSpec {
    /// Labels for the MachineConfig, defaulting to the worker role
    pub fn labels(&self) -> BTreeMap<String, String> {
        if self.selector.is_empty() {
            BTreeMap::from([(
                MACHINE_CONFIG_ROLE_LABEL.to_string(),
                DEFAULT_MACHINE_CONFIG_POOL.to_string(),
            )])
        } else {
            self.selector.clone()
        }
    }

    /// Name of the MachineConfigPool that rolls out the configuration
    pub fn pool_name(&self) -> String {
        self.selector
            .get(MACHINE_CONFIG_ROLE_LABEL)
            .cloned()
            .unwrap_or_else(|| DEFAULT_MACHINE_CONFIG_POOL.to_string())
    }
}

/// Discovery agent settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryAgentSpec {
    /// Create the LocalVolumeDiscovery object
    #[serde(default)]
    pub enabled: bool,
}

/// Backing Storage Scale cluster settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackingClusterSpec {
    /// Create the cluster object if it does not exist
    #[serde(default)]
    pub enabled: bool,

    /// Node selector for the Storage Scale daemons
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

impl BackingClusterSpec {
    /// Daemon node selector, defaulting to the storage role label
    pub fn daemon_node_selector(&self) -> BTreeMap<String, String> {
        if self.node_selector.is_empty() {
            BTreeMap::from([(
                STORAGE_ROLE_LABEL.to_string(),
                STORAGE_ROLE_VALUE.to_string(),
            )])
        } else {
            self.node_selector.clone()
        }
    }
}

/// FusionAccess status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FusionAccessStatus {
    /// Outcome of the one-time image-pull check
    #[serde(default)]
    pub image_pull_check: ImagePullCheck,

    /// Failure detail when the image-pull check failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_error: Option<String>,
}

/// Image-pull check state; leaves `NotRun` exactly once
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImagePullCheck {
    /// The check has not completed yet
    #[default]
    NotRun,
    /// The test image was pulled
    Success,
    /// The test image could not be pulled or the check timed out
    Failed,
}

impl std::fmt::Display for ImagePullCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImagePullCheck::NotRun => write!(f, "NotRun"),
            ImagePullCheck::Success => write!(f, "Success"),
            ImagePullCheck::Failed => write!(f, "Failed"),
        }
    }
}

impl FusionAccess {
    /// Persisted image-pull check state (absent status means not run)
    pub fn image_pull_check(&self) -> ImagePullCheck {
        self.status
            .as_ref()
            .map(|s| s.image_pull_check)
            .unwrap_or_default()
    }
}
