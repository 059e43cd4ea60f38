//! Storage Scale cluster object
//!
//! The `Cluster` is created once and then owned by the Storage Scale
//! operator. Later changes to the FusionAccess spec are never pushed into
//! it; an existing object is left alone.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::info;

use fusion_common::crd::ScaleCluster;
use fusion_common::kube_utils::HasApiResource;
use fusion_common::Error;

use crate::client::{ClusterResources, ObjectKey};

/// Name of the backing cluster object
pub const BACKING_CLUSTER_NAME: &str = "ibm-spectrum-scale";

/// What [`ensure_backing_cluster`] found or did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingClusterState {
    /// The object was created by this call
    Created,
    /// The object already existed and was not touched
    AlreadyPresent,
}

/// Cluster object with the daemons pinned by `node_selector`
pub fn scale_cluster(node_selector: &BTreeMap<String, String>) -> Value {
    json!({
        "apiVersion": ScaleCluster::API_VERSION,
        "kind": ScaleCluster::KIND,
        "metadata": { "name": BACKING_CLUSTER_NAME },
        "spec": {
            "license": {
                "accept": true,
                "license": "data-management",
            },
            "pmcollector": {
                "nodeSelector": node_selector,
            },
            "daemon": {
                "nodeSelector": node_selector,
                "clusterProfile": {
                    "controlSetxattrImmutableSELinux": "yes",
                    "enforceFilesetQuotaOnRoot": "yes",
                    "ignorePrefetchLUNCount": "yes",
                    "initPrefetchBuffers": "128",
                    "maxblocksize": "16M",
                    "prefetchPct": "25",
                    "prefetchTimeout": "30",
                },
                "roles": [
                    {
                        "name": "client",
                        "resources": { "cpu": "2", "memory": "4Gi" },
                    },
                    {
                        "name": "storage",
                        "resources": { "cpu": "2", "memory": "8Gi" },
                    }
                ],
            }
        }
    })
}

/// Create the backing cluster unless it already exists
///
/// A create that loses a race with another writer (409) counts as present.
pub async fn ensure_backing_cluster(
    resources: &dyn ClusterResources,
    node_selector: &BTreeMap<String, String>,
) -> Result<BackingClusterState, Error> {
    let key = ObjectKey::cluster(ScaleCluster::api_resource(), BACKING_CLUSTER_NAME);

    if resources.get(&key).await?.is_some() {
        info!(cluster = BACKING_CLUSTER_NAME, "backing cluster exists, leaving it untouched");
        return Ok(BackingClusterState::AlreadyPresent);
    }

    match resources.create(&key, &scale_cluster(node_selector)).await {
        Ok(()) => {
            info!(cluster = BACKING_CLUSTER_NAME, "created backing cluster");
            Ok(BackingClusterState::Created)
        }
        Err(e) if e.is_conflict() => Ok(BackingClusterState::AlreadyPresent),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterResources;
    use kube::api::DynamicObject;

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([(
            "scale.spectrum.ibm.com/role".to_string(),
            "storage".to_string(),
        )])
    }

    fn existing() -> DynamicObject {
        serde_json::from_value(scale_cluster(&selector())).unwrap()
    }

    #[test]
    fn cluster_accepts_license_and_pins_daemons() {
        let cluster = scale_cluster(&selector());
        assert_eq!(cluster["spec"]["license"]["accept"], true);
        assert_eq!(
            cluster["spec"]["daemon"]["nodeSelector"]["scale.spectrum.ibm.com/role"],
            "storage"
        );
    }

    #[tokio::test]
    async fn missing_cluster_is_created() {
        let mut resources = MockClusterResources::new();
        resources.expect_get().returning(|_| Ok(None));
        resources
            .expect_create()
            .withf(|key, obj| key.name == BACKING_CLUSTER_NAME && obj["kind"] == "Cluster")
            .times(1)
            .returning(|_, _| Ok(()));

        let state = ensure_backing_cluster(&resources, &selector()).await.unwrap();
        assert_eq!(state, BackingClusterState::Created);
    }

    #[tokio::test]
    async fn existing_cluster_is_never_modified() {
        let mut resources = MockClusterResources::new();
        resources.expect_get().returning(|_| Ok(Some(existing())));
        resources.expect_create().never();
        resources.expect_apply().never();
        resources.expect_merge_patch().never();

        let state = ensure_backing_cluster(&resources, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(state, BackingClusterState::AlreadyPresent);
    }

    #[tokio::test]
    async fn conflict_on_create_counts_as_present() {
        let mut resources = MockClusterResources::new();
        resources.expect_get().returning(|_| Ok(None));
        resources.expect_create().returning(|_, _| {
            Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".into(),
                message: "already exists".into(),
                reason: "AlreadyExists".into(),
                code: 409,
            })))
        });

        let state = ensure_backing_cluster(&resources, &selector()).await.unwrap();
        assert_eq!(state, BackingClusterState::AlreadyPresent);
    }
}
