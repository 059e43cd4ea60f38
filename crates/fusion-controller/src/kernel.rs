//! Kernel configuration via MachineConfig
//!
//! Storage Scale builds its kernel module on the nodes, so they need the
//! `kernel-devel` extension. The operator applies a MachineConfig and waits
//! for the machine-config operator to roll it out to the target pool.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fusion_common::crd::{KernelConfigSpec, MachineConfig, MachineConfigPool};
use fusion_common::kube_utils::{condition_is_true, poll_until, HasApiResource};
use fusion_common::Error;

use crate::client::{ClusterResources, ObjectKey};

/// Name of the kernel MachineConfig
pub const KERNEL_MACHINE_CONFIG_NAME: &str = "00-worker-ibm-spectrum-scale-kernel-devel";

/// Extensions enabled by the MachineConfig
const KERNEL_EXTENSIONS: &[&str] = &["kernel-devel"];

/// Rollout wait tuning
#[derive(Clone, Debug)]
pub struct RolloutSettings {
    /// Total time allowed for the pool to update
    pub timeout: Duration,
    /// Delay between pool reads
    pub interval: Duration,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(10),
        }
    }
}

/// MachineConfig enabling the kernel extensions, labeled for its pool
pub fn machine_config(spec: &KernelConfigSpec) -> Value {
    json!({
        "apiVersion": MachineConfig::API_VERSION,
        "kind": MachineConfig::KIND,
        "metadata": {
            "name": KERNEL_MACHINE_CONFIG_NAME,
            "labels": spec.labels(),
        },
        "spec": {
            "extensions": KERNEL_EXTENSIONS,
        }
    })
}

/// Whether `pool` has finished rolling out a rendered config containing `machine_config`
pub fn pool_rolled_out(pool: &Value, machine_config: &str) -> bool {
    let rendered = pool
        .pointer("/status/configuration/source")
        .and_then(Value::as_array)
        .is_some_and(|sources| {
            sources
                .iter()
                .any(|s| s.get("name").and_then(Value::as_str) == Some(machine_config))
        });
    if !rendered {
        return false;
    }

    if !condition_is_true(pool, "Updated") || condition_is_true(pool, "Updating") {
        return false;
    }

    let count = |field: &str| pool.pointer(field).and_then(Value::as_i64);
    count("/status/machineCount") == count("/status/updatedMachineCount")
}

/// Apply the kernel MachineConfig and wait for its pool to roll it out
pub async fn apply_kernel_config(
    resources: &dyn ClusterResources,
    spec: &KernelConfigSpec,
    settings: &RolloutSettings,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let mc_key = ObjectKey::cluster(MachineConfig::api_resource(), KERNEL_MACHINE_CONFIG_NAME);
    resources.apply(&mc_key, &machine_config(spec)).await?;
    info!(machine_config = KERNEL_MACHINE_CONFIG_NAME, "applied kernel MachineConfig");

    let pool_name = spec.pool_name();
    let pool_key = ObjectKey::cluster(MachineConfigPool::api_resource(), pool_name.clone());
    let operation = format!("MachineConfigPool {pool_name} rollout");

    poll_until(settings.timeout, settings.interval, cancel, &operation, || {
        let pool_key = &pool_key;
        async move {
            let Some(pool) = resources.get(pool_key).await? else {
                debug!(pool = %pool_key.name, "MachineConfigPool not found yet");
                return Ok(false);
            };
            let pool = serde_json::to_value(&pool).map_err(|e| {
                Error::serialization_for_kind(MachineConfigPool::KIND, e.to_string())
            })?;
            Ok(pool_rolled_out(&pool, KERNEL_MACHINE_CONFIG_NAME))
        }
    })
    .await?;

    info!(pool = %pool_name, "MachineConfigPool updated");
    Ok(())
}
