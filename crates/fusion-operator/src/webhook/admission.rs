//! FusionAccess validating admission
//!
//! Rejects a second FusionAccess and applies the version policy to the
//! declared product version before the object is persisted. Nothing is
//! mutated.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use fusion_common::crd::FusionAccess;
use fusion_common::version::{
    unsupported_message, CompatibilityMatrix, PlatformVersion, VersionPolicy, VersionVerdict,
};
use fusion_common::Error;
use fusion_controller::client::{read_platform_version, KubeClient};

use super::WebhookState;

/// Denial returned when a FusionAccess already exists
pub const SINGLETON_MESSAGE: &str = "only one FusionAccess resource is allowed";

/// Cluster reads the admission decision depends on
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AdmissionLookup: Send + Sync {
    /// Every FusionAccess in the cluster
    async fn list_instances(&self) -> Result<Vec<FusionAccess>, Error>;

    /// Current OpenShift version
    async fn platform_version(&self) -> Result<PlatformVersion, Error>;
}

/// [`AdmissionLookup`] over the controller's Kubernetes client
pub struct KubeAdmissionLookup {
    kube: Arc<dyn KubeClient>,
}

impl KubeAdmissionLookup {
    /// Look things up through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

#[async_trait]
impl AdmissionLookup for KubeAdmissionLookup {
    async fn list_instances(&self) -> Result<Vec<FusionAccess>, Error> {
        self.kube.list_fusion_access().await
    }

    async fn platform_version(&self) -> Result<PlatformVersion, Error> {
        read_platform_version(self.kube.as_ref()).await
    }
}

/// Admission decision for one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Persist the object
    Allow,
    /// Persist the object and show the user a warning
    Warn(String),
    /// Refuse the write
    Deny(String),
}

impl Verdict {
    fn into_response(self, request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let mut response = AdmissionResponse::from(request);
        match self {
            Verdict::Allow => response,
            Verdict::Warn(message) => {
                response.warnings = Some(vec![message]);
                response
            }
            Verdict::Deny(message) => response.deny(message),
        }
    }
}

/// Validation rules for FusionAccess writes
pub struct AdmissionGate {
    lookup: Arc<dyn AdmissionLookup>,
    matrix: CompatibilityMatrix,
    policy: VersionPolicy,
}

impl AdmissionGate {
    /// Gate using the built-in compatibility matrix
    pub fn new(lookup: Arc<dyn AdmissionLookup>, policy: VersionPolicy) -> Self {
        Self {
            lookup,
            matrix: CompatibilityMatrix::builtin(),
            policy,
        }
    }

    /// Admit a new FusionAccess
    ///
    /// Any existing instance is a denial, whatever the new object says.
    pub async fn validate_create(&self, fa: &FusionAccess) -> Verdict {
        let name = fa.name_any();
        let existing = match self.lookup.list_instances().await {
            Ok(existing) => existing,
            Err(e) => {
                error!(fusion_access = %name, error = %e, "cannot list FusionAccess resources");
                return Verdict::Deny(format!("cannot list FusionAccess resources: {e}"));
            }
        };
        if !existing.is_empty() {
            info!(
                fusion_access = %name,
                existing = existing.len(),
                "rejecting second FusionAccess"
            );
            return Verdict::Deny(SINGLETON_MESSAGE.to_string());
        }

        if !self.policy.is_checked() {
            return Verdict::Allow;
        }

        let product = &fa.spec.product_version;
        let platform = match self.lookup.platform_version().await {
            Ok(platform) => platform,
            Err(e) if self.policy == VersionPolicy::Enforce => {
                return Verdict::Deny(format!("cannot determine OpenShift version: {e}"));
            }
            Err(e) => {
                warn!(fusion_access = %name, error = %e, "cannot determine OpenShift version");
                return Verdict::Warn(format!(
                    "OpenShift version unknown, compatibility of {product} not checked"
                ));
            }
        };

        let supported = self.matrix.is_supported(product, &platform);
        match self.policy.evaluate(supported) {
            VersionVerdict::Allowed => Verdict::Allow,
            VersionVerdict::Warn => {
                let message = unsupported_message(product, &platform);
                warn!(fusion_access = %name, %platform, product = %product, "{message}");
                Verdict::Warn(message)
            }
            VersionVerdict::Deny => Verdict::Deny(unsupported_message(product, &platform)),
        }
    }

    /// Admit a change to an existing FusionAccess
    pub fn validate_update(&self, old: &FusionAccess, new: &FusionAccess) -> Verdict {
        info!(
            fusion_access = %new.name_any(),
            from = %old.spec.product_version,
            to = %new.spec.product_version,
            "FusionAccess updated"
        );
        Verdict::Allow
    }

    /// Admit removal of a FusionAccess
    pub fn validate_delete(&self, old: Option<&FusionAccess>) -> Verdict {
        info!(fusion_access = ?old.map(|fa| fa.name_any()), "FusionAccess deleted");
        Verdict::Allow
    }

    async fn review(
        &self,
        operation: &Operation,
        object: Option<&FusionAccess>,
        old_object: Option<&FusionAccess>,
    ) -> Verdict {
        match (operation, object, old_object) {
            (Operation::Create, Some(fa), _) => self.validate_create(fa).await,
            (Operation::Create, None, _) => {
                Verdict::Deny("create request carries no object".into())
            }
            (Operation::Update, Some(new), Some(old)) => self.validate_update(old, new),
            (Operation::Delete, _, old) => self.validate_delete(old),
            (operation, _, _) => {
                debug!(?operation, "nothing to validate");
                Verdict::Allow
            }
        }
    }
}

/// Read an admission object as a FusionAccess
fn decode(object: Option<&DynamicObject>) -> Result<Option<FusionAccess>, serde_json::Error> {
    object
        .map(|obj| serde_json::to_value(obj).and_then(serde_json::from_value))
        .transpose()
}

/// Handle a validating admission review for FusionAccess
///
/// The body is taken untyped so that an object that does not match the
/// FusionAccess schema still gets an admission response carrying its uid.
pub async fn validate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let request: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let object = match decode(request.object.as_ref()) {
        Ok(object) => object,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "admission object is not a valid FusionAccess");
            let response =
                AdmissionResponse::from(&request).deny(format!("invalid FusionAccess: {e}"));
            return Json(response.into_review());
        }
    };
    // A broken stored object must not block its own removal
    let old_object = decode(request.old_object.as_ref()).unwrap_or_else(|e| {
        debug!(uid = %request.uid, error = %e, "old object is not a valid FusionAccess");
        None
    });

    let verdict = state
        .gate
        .review(&request.operation, object.as_ref(), old_object.as_ref())
        .await;
    debug!(uid = %request.uid, ?verdict, "admission decided");
    Json(verdict.into_response(&request).into_review())
}
