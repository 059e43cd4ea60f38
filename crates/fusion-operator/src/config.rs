//! Operator configuration from flags and environment

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use fusion_common::version::VersionPolicy;
use fusion_common::{DEFAULT_OPERATOR_NAMESPACE, DEFAULT_PULL_SECRET_NAME, DEFAULT_WEBHOOK_PORT};
use fusion_controller::console::DEFAULT_PLUGIN_IMAGE;
use fusion_controller::kernel::RolloutSettings;
use fusion_controller::probe::ProbeSettings;
use fusion_controller::ControllerSettings;

/// Settings shared by every run mode
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace the operator runs in
    #[arg(
        long,
        env = "POD_NAMESPACE",
        default_value = DEFAULT_OPERATOR_NAMESPACE
    )]
    pub namespace: String,

    /// Directory holding one manifest directory per product version
    #[arg(long, env = "FUSION_MANIFEST_DIR", default_value = "/manifests")]
    pub manifest_dir: PathBuf,

    /// Operator pull secret copied into the Storage Scale namespaces
    #[arg(
        long,
        env = "FUSION_PULL_SECRET",
        default_value = DEFAULT_PULL_SECRET_NAME
    )]
    pub pull_secret: String,

    /// Console plugin image
    #[arg(
        long,
        env = "RELATED_IMAGE_CONSOLE_PLUGIN",
        default_value = DEFAULT_PLUGIN_IMAGE
    )]
    pub console_plugin_image: String,

    /// Seconds allowed for the image-pull probe
    #[arg(long, env = "FUSION_PROBE_TIMEOUT_SECS", default_value_t = 300)]
    pub probe_timeout_secs: u64,

    /// Seconds allowed for the worker pool to roll out kernel configuration
    #[arg(long, env = "FUSION_KERNEL_TIMEOUT_SECS", default_value_t = 1800)]
    pub kernel_timeout_secs: u64,

    /// Seconds between successful reconciles
    #[arg(long, env = "FUSION_RESYNC_SECS", default_value_t = 300)]
    pub resync_secs: u64,

    /// Handling of unsupported product/platform combinations: enforce, warn-only or ignore
    #[arg(long, env = "FUSION_VERSION_POLICY", default_value = "warn-only")]
    pub version_policy: VersionPolicy,

    /// Address the admission webhook listens on
    #[arg(
        long,
        env = "WEBHOOK_BIND_ADDRESS",
        default_value_t = default_webhook_addr()
    )]
    pub webhook_addr: SocketAddr,

    /// Serving certificate for the admission webhook
    #[arg(
        long,
        env = "WEBHOOK_TLS_CERT",
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt"
    )]
    pub webhook_cert: PathBuf,

    /// Private key for the admission webhook
    #[arg(
        long,
        env = "WEBHOOK_TLS_KEY",
        default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key"
    )]
    pub webhook_key: PathBuf,
}

fn default_webhook_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_WEBHOOK_PORT))
}

impl OperatorConfig {
    /// Resolved version policy
    pub fn policy(&self) -> VersionPolicy {
        self.version_policy
    }

    /// Settings for the FusionAccess controller
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            operator_namespace: self.namespace.clone(),
            pull_secret_name: self.pull_secret.clone(),
            manifest_dir: self.manifest_dir.clone(),
            console_plugin_image: self.console_plugin_image.clone(),
            probe: ProbeSettings {
                timeout: Duration::from_secs(self.probe_timeout_secs),
                pull_secret: Some(self.pull_secret.clone()),
                ..Default::default()
            },
            rollout: RolloutSettings {
                timeout: Duration::from_secs(self.kernel_timeout_secs),
                ..Default::default()
            },
            resync: Duration::from_secs(self.resync_secs),
            version_policy: self.policy(),
        }
    }
}
