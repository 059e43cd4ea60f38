//! OpenShift ClusterVersion (read-only view)
//!
//! Only the fields needed to work out which platform version is actually
//! running are modelled. The object is owned by the cluster-version operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the singleton ClusterVersion object
pub const CLUSTER_VERSION_NAME: &str = "version";

/// Spec of the platform's ClusterVersion object
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "ClusterVersion",
    status = "ClusterVersionStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    /// Update channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Unique cluster identifier
    #[serde(default, rename = "clusterID", skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

/// Status of the platform's ClusterVersion object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionStatus {
    /// Release the cluster is moving towards
    #[serde(default)]
    pub desired: Release,

    /// Update history, newest entry first
    #[serde(default)]
    pub history: Vec<UpdateHistory>,
}

/// A platform release
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Semantic version of the release
    #[serde(default)]
    pub version: String,

    /// Release payload image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// One entry of the update history
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateHistory {
    /// Whether the update finished rolling out
    pub state: UpdateState,

    /// Version that was being applied
    pub version: String,
}

/// Rollout state of a history entry
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateState {
    /// Every component reached the version
    Completed,
    /// The update is in progress or was abandoned
    Partial,
    /// Any state this operator does not know about
    #[serde(other)]
    Unknown,
}
