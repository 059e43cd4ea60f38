//! Shared Kubernetes utilities using kube-rs
//!
//! Manifest application, dynamic API resource resolution, bounded polling,
//! and client construction. Everything here talks to the API server through
//! kube-rs; nothing shells out.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiResource, Discovery};
use kube::{Client, Config};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{Error, FIELD_MANAGER};

/// Types with a compile-time known apiVersion and kind
///
/// Used for objects owned by other operators that are handled as
/// `DynamicObject`s, so every caller builds the same `ApiResource`.
pub trait HasApiResource {
    /// Full API version (e.g., "machineconfiguration.openshift.io/v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "MachineConfig")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// The version is used exactly as given; no discovery round-trip.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use fusion_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Irregular plurals of kinds this operator touches
const KIND_PLURALS: &[(&str, &str)] = &[
    ("securitycontextconstraints", "securitycontextconstraints"),
    ("endpoints", "endpoints"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple English
/// pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Get priority for a Kubernetes resource kind (lower = apply first)
///
/// Namespaces and CRDs must exist before anything that lives in them or is
/// an instance of them. RBAC precedes the workloads that rely on it.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "SecurityContextConstraints" => 5,
        "ConfigMap" | "Secret" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        _ => 9,
    }
}

/// Kind of a parsed manifest, empty when absent
pub fn manifest_kind(manifest: &Value) -> &str {
    manifest.get("kind").and_then(Value::as_str).unwrap_or("")
}

/// Parsed manifest metadata for applying to Kubernetes
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// Resource name
    pub name: String,
    /// Optional namespace
    pub namespace: Option<String>,
    /// Group/version/kind from the manifest
    pub gvk: GroupVersionKind,
}

/// Extract what is needed to address a manifest on the API server
pub fn manifest_metadata(manifest: &Value) -> Result<ManifestMetadata, Error> {
    let missing = |field: &str| {
        Error::serialization_for_kind(
            manifest_kind(manifest).to_string(),
            format!("manifest missing {field}"),
        )
    };

    let api_version = manifest
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("apiVersion"))?;
    let kind = manifest
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("kind"))?;
    let name = manifest
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("metadata.name"))?;
    let namespace = manifest
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .map(str::to_string);

    let (group, version) = parse_api_version(api_version);
    Ok(ManifestMetadata {
        name: name.to_string(),
        namespace,
        gvk: GroupVersionKind {
            group,
            version,
            kind: kind.to_string(),
        },
    })
}

/// Server-side apply one object at the given API resource
pub async fn apply_object(
    client: &Client,
    api_resource: &ApiResource,
    namespace: Option<&str>,
    name: &str,
    object: &Value,
) -> Result<(), Error> {
    let api: Api<DynamicObject> = match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, api_resource),
        None => Api::all_with(client.clone(), api_resource),
    };
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await?;
    trace!(kind = %api_resource.kind, name = %name, namespace = ?namespace, "applied object");
    Ok(())
}

/// Apply a single manifest using pre-computed API discovery
///
/// Discovery resolves the served resource for the manifest's GVK, so CRDs
/// applied earlier in the same set are usable once discovery is refreshed.
pub async fn apply_manifest_with_discovery(
    client: &Client,
    discovery: &Discovery,
    manifest: &Value,
) -> Result<(), Error> {
    let meta = manifest_metadata(manifest)?;

    let Some((api_resource, _)) = discovery.resolve_gvk(&meta.gvk) else {
        return Err(Error::internal_with_context(
            "apply_manifest_with_discovery",
            format!(
                "unknown resource type: {}/{} {}",
                meta.gvk.group, meta.gvk.version, meta.gvk.kind
            ),
        ));
    };

    apply_object(
        client,
        &api_resource,
        meta.namespace.as_deref(),
        &meta.name,
        manifest,
    )
    .await
    .map_err(|e| {
        Error::internal_with_context(
            "apply_manifest_with_discovery",
            format!("failed to apply {}/{}: {}", meta.gvk.kind, meta.name, e),
        )
    })
}

async fn run_discovery(client: &Client) -> Result<Discovery, Error> {
    Discovery::new(client.clone())
        .run()
        .await
        .map_err(|e| Error::internal_with_context("api-discovery", e.to_string()))
}

/// Apply a set of manifests with proper ordering and discovery
///
/// 1. Namespaces and CRDs first, fail-fast (nothing else works without them)
/// 2. Re-run discovery only if CRDs were applied
/// 3. Everything else sorted by kind priority, best-effort: every manifest is
///    attempted and the first error is returned afterwards
pub async fn apply_manifests_with_discovery(
    client: &Client,
    manifests: &[Value],
) -> Result<(), Error> {
    if manifests.is_empty() {
        return Ok(());
    }

    let (mut foundational, mut rest): (Vec<&Value>, Vec<&Value>) =
        manifests.iter().partition(|m| {
            let kind = manifest_kind(m);
            kind == "Namespace" || kind == "CustomResourceDefinition"
        });
    foundational.sort_by_key(|m| kind_priority(manifest_kind(m)));
    rest.sort_by_key(|m| kind_priority(manifest_kind(m)));

    let has_crds = foundational
        .iter()
        .any(|m| manifest_kind(m) == "CustomResourceDefinition");

    let mut discovery = run_discovery(client).await?;
    for manifest in &foundational {
        apply_manifest_with_discovery(client, &discovery, manifest).await?;
    }
    if has_crds && !rest.is_empty() {
        discovery = run_discovery(client).await?;
    }

    let mut first_error: Option<Error> = None;
    let mut failed = 0usize;
    for manifest in &rest {
        if let Err(e) = apply_manifest_with_discovery(client, &discovery, manifest).await {
            failed += 1;
            warn!(
                error = %e,
                kind = %manifest_kind(manifest),
                "manifest apply failed, continuing with remaining manifests"
            );
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => {
            warn!(failed, total = manifests.len(), "some manifests failed to apply");
            Err(e)
        }
        None => {
            debug!(total = manifests.len(), "applied manifest set");
            Ok(())
        }
    }
}

/// Poll until a condition is met, the timeout elapses, or `cancel` fires
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep waiting.
/// A check error ends the wait and is returned as-is; callers that want to
/// keep waiting through a missing object map it to `Ok(false)` themselves.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
    operation: &str,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(operation, "condition not yet met"),
            Err(e) => {
                debug!(operation, error = %e, "poll check failed");
                return Err(e);
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::timeout(
                operation,
                format!("condition not met within {}s", timeout.as_secs()),
            ));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Whether a status condition of the given type has status "True"
///
/// Works on the untyped `status.conditions` array common to most objects.
pub fn condition_is_true(object: &Value, condition_type: &str) -> bool {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(condition_type)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the in-cluster or default kubeconfig is inferred.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
