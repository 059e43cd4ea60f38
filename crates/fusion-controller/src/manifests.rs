//! Product manifest sets
//!
//! Install manifests are shipped next to the operator, one directory per
//! product version: `<root>/<version>/*.yaml`. The set is read fresh on every
//! reconcile and applied as a whole.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use fusion_common::version::ProductVersion;
use fusion_common::yaml::parse_yaml_documents;
use fusion_common::Error;

/// Loads the manifest set for a product version
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Every object in the set, in file order
    async fn load(&self, version: &str) -> Result<Vec<Value>, Error>;
}

/// Manifests read from a directory tree on disk
pub struct DirectoryManifestSource {
    root: PathBuf,
}

impl DirectoryManifestSource {
    /// Read manifest sets below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the set for `version`
    ///
    /// The version must parse as a product version, which keeps path
    /// separators and `..` out of the join.
    pub fn version_dir(&self, version: &str) -> Result<PathBuf, Error> {
        let parsed: ProductVersion = version.parse().map_err(|_| {
            Error::validation_for_field(
                "FusionAccess",
                "spec.productVersion",
                format!("invalid product version {version:?}"),
            )
        })?;
        Ok(self.root.join(parsed.to_string()))
    }
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[async_trait]
impl ManifestSource for DirectoryManifestSource {
    async fn load(&self, version: &str) -> Result<Vec<Value>, Error> {
        let dir = self.version_dir(version)?;

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            Error::manifest(version, format!("cannot read {}: {e}", dir.display()))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::manifest(version, e.to_string()))?
        {
            let path = entry.path();
            if is_manifest_file(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut manifests = Vec::new();
        for path in files {
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                Error::manifest(version, format!("cannot read {}: {e}", path.display()))
            })?;
            let docs = parse_yaml_documents(&content).map_err(|e| {
                Error::manifest(version, format!("invalid YAML in {}: {e}", path.display()))
            })?;
            debug!(file = %path.display(), documents = docs.len(), "loaded manifest file");
            manifests.extend(docs);
        }

        if manifests.is_empty() {
            return Err(Error::manifest(
                version,
                format!("no manifests found in {}", dir.display()),
            ));
        }
        Ok(manifests)
    }
}
