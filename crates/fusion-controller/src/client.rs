//! Kubernetes access behind mockable traits
//!
//! The controller never touches `kube::Client` directly. Typed operations go
//! through [`KubeClient`]; objects owned by other operators go through
//! [`ClusterResources`] as untyped JSON. Both have real implementations here
//! and mockall mocks in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use fusion_common::crd::{ClusterVersion, FusionAccess, FusionAccessStatus, CLUSTER_VERSION_NAME};
use fusion_common::kube_utils::{apply_manifests_with_discovery, apply_object};
use fusion_common::version::{current_platform_version, PlatformVersion};
use fusion_common::{Error, FIELD_MANAGER};

/// Map a 404 into `None`, pass everything else through
fn not_found_as_none<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) => {
            let e = Error::from(e);
            if e.is_not_found() {
                Ok(None)
            } else {
                Err(e)
            }
        }
    }
}

/// Current platform version from the singleton ClusterVersion
pub async fn read_platform_version(kube: &dyn KubeClient) -> Result<PlatformVersion, Error> {
    let cv = kube.get_cluster_version().await?.ok_or_else(|| {
        Error::internal_with_context("platform-version", "ClusterVersion version not found")
    })?;
    current_platform_version(&cv.status.unwrap_or_default())
}

/// Typed Kubernetes operations used by the controller and admission gate
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a FusionAccess by namespace and name
    async fn get_fusion_access(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FusionAccess>, Error>;

    /// List FusionAccess resources in every namespace
    async fn list_fusion_access(&self) -> Result<Vec<FusionAccess>, Error>;

    /// Merge-patch the status sub-resource of a FusionAccess
    async fn patch_fusion_access_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FusionAccessStatus,
    ) -> Result<(), Error>;

    /// Get the platform's ClusterVersion singleton
    async fn get_cluster_version(&self) -> Result<Option<ClusterVersion>, Error>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret; fails if it already exists
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Replace an existing Secret
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Create a Pod; fails with 409 if the name is taken
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error>;

    /// Get a Pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Delete a Pod; deleting a missing Pod is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_fusion_access(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<FusionAccess>, Error> {
        let api: Api<FusionAccess> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn list_fusion_access(&self) -> Result<Vec<FusionAccess>, Error> {
        let api: Api<FusionAccess> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn patch_fusion_access_status(
        &self,
        namespace: &str,
        name: &str,
        status: &FusionAccessStatus,
    ) -> Result<(), Error> {
        let api: Api<FusionAccess> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_cluster_version(&self) -> Result<Option<ClusterVersion>, Error> {
        let api: Api<ClusterVersion> = Api::all(self.client.clone());
        not_found_as_none(api.get(CLUSTER_VERSION_NAME).await)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = secret.metadata.name.as_deref().ok_or_else(|| {
            Error::internal_with_context("replace_secret", "secret has no metadata.name")
        })?;
        api.replace(name, &PostParams::default(), secret).await?;
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        not_found_as_none(api.get(name).await)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Address of an object handled as untyped JSON
#[derive(Clone, Debug)]
pub struct ObjectKey {
    /// Resolved API resource (group, version, plural)
    pub api_resource: ApiResource,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a cluster-scoped object
    pub fn cluster(api_resource: ApiResource, name: impl Into<String>) -> Self {
        Self {
            api_resource,
            namespace: None,
            name: name.into(),
        }
    }

    /// Key for a namespaced object
    pub fn namespaced(
        api_resource: ApiResource,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_resource,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    fn api(&self, client: &Client) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &self.api_resource),
            None => Api::all_with(client.clone(), &self.api_resource),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.api_resource.kind, ns, self.name),
            None => write!(f, "{} {}", self.api_resource.kind, self.name),
        }
    }
}

/// Untyped operations on objects owned by other operators
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterResources: Send + Sync {
    /// Server-side apply (create or update) an object
    async fn apply(&self, key: &ObjectKey, object: &Value) -> Result<(), Error>;

    /// Get an object, `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, Error>;

    /// Create an object; fails with 409 if it already exists
    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<(), Error>;

    /// JSON merge-patch an existing object
    async fn merge_patch(&self, key: &ObjectKey, patch: &Value) -> Result<(), Error>;

    /// Apply a manifest set, resolving kinds through API discovery
    async fn apply_manifests(&self, manifests: &[Value]) -> Result<(), Error>;
}

/// Real implementation of [`ClusterResources`]
pub struct ClusterResourcesImpl {
    client: Client,
}

impl ClusterResourcesImpl {
    /// Wrap the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterResources for ClusterResourcesImpl {
    async fn apply(&self, key: &ObjectKey, object: &Value) -> Result<(), Error> {
        apply_object(
            &self.client,
            &key.api_resource,
            key.namespace.as_deref(),
            &key.name,
            object,
        )
        .await
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, Error> {
        not_found_as_none(key.api(&self.client).get(&key.name).await)
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<(), Error> {
        let obj: DynamicObject = serde_json::from_value(object.clone()).map_err(|e| {
            Error::serialization_for_kind(key.api_resource.kind.clone(), e.to_string())
        })?;
        key.api(&self.client)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(())
    }

    async fn merge_patch(&self, key: &ObjectKey, patch: &Value) -> Result<(), Error> {
        key.api(&self.client)
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await?;
        Ok(())
    }

    async fn apply_manifests(&self, manifests: &[Value]) -> Result<(), Error> {
        apply_manifests_with_discovery(&self.client, manifests).await
    }
}
