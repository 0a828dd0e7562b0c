//! Registry backed by a YAML file that is re-read on every lookup.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{
    BindingError, BindingResolver, Cluster, ClusterBinding, ClusterDirectory, DirectoryError,
    RegistryDocument,
};

/// File-backed registry.
///
/// Every lookup reads and parses the file, so edits (new bindings, rotated
/// certificates, removed members) take effect on the next request. Read or
/// parse failures surface as `Unavailable`, never as `NotFound`.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    /// Create a registry reading from `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the registry file.
    pub async fn load(&self) -> Result<RegistryDocument, String> {
        let yaml = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| format!("cannot read '{}': {e}", self.path.display()))?;
        let mut doc = RegistryDocument::from_yaml(&yaml)
            .map_err(|e| format!("cannot parse '{}': {e}", self.path.display()))?;
        if let Some(dir) = self.path.parent() {
            doc.rebase(dir);
        }
        debug!(
            path = %self.path.display(),
            clusters = doc.clusters.len(),
            bindings = doc.bindings.len(),
            "Registry file loaded"
        );
        Ok(doc)
    }
}

#[async_trait]
impl ClusterDirectory for FileRegistry {
    async fn resolve(&self, name: &str) -> Result<Cluster, DirectoryError> {
        let doc = self.load().await.map_err(DirectoryError::Unavailable)?;
        let record = doc
            .clusters
            .get(name)
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))?;
        record
            .load(name)
            .await
            .map_err(|e| DirectoryError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl BindingResolver for FileRegistry {
    async fn resolve_binding(
        &self,
        cluster: &str,
        user: &str,
    ) -> Result<ClusterBinding, BindingError> {
        let doc = self.load().await.map_err(BindingError::Unavailable)?;
        let record = doc
            .find_binding(cluster, user)
            .ok_or(BindingError::Unauthorized)?;
        record
            .load()
            .await
            .map_err(|e| BindingError::Unavailable(e.to_string()))
    }
}
