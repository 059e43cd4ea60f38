//! Common types for Fusion Access: CRDs, errors, version policy, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod fanout;
pub mod kube_utils;
pub mod telemetry;
pub mod version;
pub mod yaml;

pub use error::Error;

/// Namespace the operator runs in when `POD_NAMESPACE` is not set
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "ibm-fusion-access";

/// Field manager used for every server-side apply and status patch
pub const FIELD_MANAGER: &str = "fusion-access-operator";

/// Name of the entitlement pull secret created in the Storage Scale namespaces
pub const ENTITLEMENT_SECRET_NAME: &str = "ibm-entitlement-key";

/// Default name of the operator's own pull secret (the credential source)
pub const DEFAULT_PULL_SECRET_NAME: &str = "fusion-pullsecret";

/// Data key holding the registry credential inside a dockerconfigjson secret
pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// Secret type for registry credentials
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Namespaces that receive the entitlement pull secret
pub const ENTITLEMENT_TARGET_NAMESPACES: &[&str] = &[
    "ibm-spectrum-scale",
    "ibm-spectrum-scale-dns",
    "ibm-spectrum-scale-csi",
    "ibm-spectrum-scale-operator",
];

/// Default port for the HTTPS admission webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;
