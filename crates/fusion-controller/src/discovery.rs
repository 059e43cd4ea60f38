//! Local device discovery agent

use serde_json::{json, Value};
use tracing::info;

use fusion_common::crd::LocalVolumeDiscovery;
use fusion_common::kube_utils::HasApiResource;
use fusion_common::Error;

use crate::client::{ClusterResources, ObjectKey};

/// Name of the LocalVolumeDiscovery object
pub const DISCOVERY_NAME: &str = "auto-discover-devices";

/// LocalVolumeDiscovery restricted to Linux worker nodes
pub fn local_volume_discovery(namespace: &str) -> Value {
    json!({
        "apiVersion": LocalVolumeDiscovery::API_VERSION,
        "kind": LocalVolumeDiscovery::KIND,
        "metadata": {
            "name": DISCOVERY_NAME,
            "namespace": namespace,
        },
        "spec": {
            "nodeSelector": {
                "nodeSelectorTerms": [{
                    "matchExpressions": [
                        {
                            "key": "kubernetes.io/os",
                            "operator": "In",
                            "values": ["linux"],
                        },
                        {
                            "key": "node-role.kubernetes.io/worker",
                            "operator": "Exists",
                        }
                    ]
                }]
            }
        }
    })
}

/// Create or update the discovery agent in `namespace`
pub async fn apply_discovery_agent(
    resources: &dyn ClusterResources,
    namespace: &str,
) -> Result<(), Error> {
    let key = ObjectKey::namespaced(
        LocalVolumeDiscovery::api_resource(),
        namespace,
        DISCOVERY_NAME,
    );
    resources
        .apply(&key, &local_volume_discovery(namespace))
        .await?;
    info!(namespace, "applied LocalVolumeDiscovery");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterResources;

    #[test]
    fn discovery_targets_linux_workers() {
        let lvd = local_volume_discovery("ibm-fusion-access");
        let exprs = lvd
            .pointer("/spec/nodeSelector/nodeSelectorTerms/0/matchExpressions")
            .and_then(Value::as_array)
            .unwrap();
        assert!(exprs.iter().any(|e| e["values"] == json!(["linux"])));
        assert!(exprs
            .iter()
            .any(|e| e["key"] == "node-role.kubernetes.io/worker"));
    }

    #[tokio::test]
    async fn discovery_lands_in_the_operator_namespace() {
        let mut resources = MockClusterResources::new();
        resources
            .expect_apply()
            .withf(|key, obj| {
                key.namespace.as_deref() == Some("ibm-fusion-access")
                    && key.api_resource.plural == "localvolumediscoveries"
                    && obj["metadata"]["name"] == DISCOVERY_NAME
            })
            .times(1)
            .returning(|_, _| Ok(()));

        apply_discovery_agent(&resources, "ibm-fusion-access")
            .await
            .unwrap();
    }
}
