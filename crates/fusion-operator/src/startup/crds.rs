//! CRD self-installation
//!
//! The operator applies its own CRDs on start so the schema in the cluster
//! always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tracing::info;

use fusion_common::crd::FusionAccess;
use fusion_common::{Error, FIELD_MANAGER};

/// CRD definition with name and resource
pub struct CrdDef {
    /// Full CRD name (`<plural>.<group>`)
    pub name: &'static str,
    /// Generated definition
    pub crd: CustomResourceDefinition,
}

/// Every CRD owned by this operator
pub fn operator_crds() -> Vec<CrdDef> {
    vec![CrdDef {
        name: FusionAccess::crd_name(),
        crd: FusionAccess::crd(),
    }]
}

/// Install or update the operator's CRDs with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> Result<(), Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in operator_crds() {
        info!(crd = def.name, "installing CRD");
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| {
                Error::internal_with_context("ensure_crds_installed", format!("{}: {e}", def.name))
            })?;
    }

    info!("CRDs installed/updated");
    Ok(())
}
