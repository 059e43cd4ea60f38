//! Registry credential propagation
//!
//! The Storage Scale workloads pull from the entitled registry with an
//! `ibm-entitlement-key` secret in each of their namespaces. The operator
//! copies its own pull secret there on every reconcile.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use fusion_common::fanout::{upsert_all, FanOutReport, Upsert, UpsertOutcome};
use fusion_common::{
    Error, DOCKER_CONFIG_JSON_KEY, DOCKER_CONFIG_JSON_TYPE, ENTITLEMENT_SECRET_NAME,
    ENTITLEMENT_TARGET_NAMESPACES,
};

use crate::client::KubeClient;

/// Per-namespace result of a propagation pass
pub type PropagationReport = FanOutReport;

/// Where the registry credential comes from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current dockerconfigjson bytes, `None` if no credential is configured
    async fn credential(&self) -> Result<Option<Vec<u8>>, Error>;
}

/// Reads the credential from a dockerconfigjson secret
pub struct SecretCredentialSource {
    kube: Arc<dyn KubeClient>,
    namespace: String,
    name: String,
}

impl SecretCredentialSource {
    /// Read `namespace/name` on every call
    pub fn new(
        kube: Arc<dyn KubeClient>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for SecretCredentialSource {
    async fn credential(&self) -> Result<Option<Vec<u8>>, Error> {
        let Some(secret) = self.kube.get_secret(&self.namespace, &self.name).await? else {
            return Ok(None);
        };

        let resource = format!("Secret {}/{}", self.namespace, self.name);
        if secret.type_.as_deref() != Some(DOCKER_CONFIG_JSON_TYPE) {
            return Err(Error::validation_for_field(
                resource,
                "type",
                format!("expected type {DOCKER_CONFIG_JSON_TYPE}"),
            ));
        }

        secret
            .data
            .and_then(|mut data| data.remove(DOCKER_CONFIG_JSON_KEY))
            .map(|bytes| Some(bytes.0))
            .ok_or_else(|| {
                Error::validation_for_field(
                    resource,
                    "data",
                    format!("missing key {DOCKER_CONFIG_JSON_KEY}"),
                )
            })
    }
}

/// Desired entitlement secret for `namespace`
pub fn entitlement_secret(namespace: &str, credential: &[u8]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(ENTITLEMENT_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(credential.to_vec()),
        )])),
        ..Default::default()
    }
}

fn matches_credential(existing: &Secret, desired: &Secret) -> bool {
    existing.type_ == desired.type_ && existing.data == desired.data
}

async fn upsert_entitlement(kube: &dyn KubeClient, namespace: &str, credential: &[u8]) -> Upsert {
    let desired = entitlement_secret(namespace, credential);

    let existing = match kube.get_secret(namespace, ENTITLEMENT_SECRET_NAME).await {
        Ok(existing) => existing,
        Err(e) => return Upsert::Abort(e),
    };

    match existing {
        None => match kube.create_secret(namespace, &desired).await {
            Ok(()) => {
                info!(namespace, "created entitlement secret");
                Upsert::Done(UpsertOutcome::Created)
            }
            Err(e) => Upsert::Failed(e),
        },
        Some(existing) if matches_credential(&existing, &desired) => {
            debug!(namespace, "entitlement secret already up to date");
            Upsert::Done(UpsertOutcome::Unchanged)
        }
        Some(existing) => {
            let updated = Secret {
                metadata: existing.metadata,
                ..desired
            };
            match kube.replace_secret(namespace, &updated).await {
                Ok(()) => {
                    info!(namespace, "updated entitlement secret");
                    Upsert::Done(UpsertOutcome::Updated)
                }
                Err(e) => Upsert::Failed(e),
            }
        }
    }
}

/// Copy `credential` into the entitlement secret of every target namespace
///
/// Namespaces are independent: a failed create or update is recorded and the
/// rest are still attempted. A failed read aborts immediately.
pub async fn propagate_credential(
    kube: &dyn KubeClient,
    credential: &[u8],
) -> Result<PropagationReport, Error> {
    upsert_all(ENTITLEMENT_TARGET_NAMESPACES, |namespace| {
        upsert_entitlement(kube, namespace, credential)
    })
    .await
}
