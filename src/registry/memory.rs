//! Registry held entirely in memory.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{
    BindingError, BindingResolver, Cluster, ClusterBinding, ClusterDirectory, DirectoryError,
    RegistryDocument,
};
use crate::{Error, Result};

/// Clusters and bindings loaded once and never re-read.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRegistry {
    clusters: HashMap<String, Cluster>,
    bindings: HashMap<(String, String), ClusterBinding>,
}

impl InMemoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every record of `doc`, reading referenced key/cert files.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first record that cannot be loaded.
    pub async fn from_document(doc: &RegistryDocument) -> Result<Self> {
        let mut registry = Self::new();
        for (name, record) in &doc.clusters {
            let cluster = record
                .load(name)
                .await
                .map_err(|e| Error::Config(format!("cluster '{name}': {e}")))?;
            registry = registry.with_cluster(cluster);
        }
        for record in &doc.bindings {
            let binding = record.load().await.map_err(|e| {
                Error::Config(format!("binding '{}@{}': {e}", record.user, record.cluster))
            })?;
            registry = registry.with_binding(binding);
        }
        Ok(registry)
    }

    /// Add (or replace) a cluster
    #[must_use]
    pub fn with_cluster(mut self, cluster: Cluster) -> Self {
        self.clusters.insert(cluster.name.clone(), cluster);
        self
    }

    /// Add (or replace) a binding
    #[must_use]
    pub fn with_binding(mut self, binding: ClusterBinding) -> Self {
        self.bindings
            .insert((binding.cluster.clone(), binding.user.clone()), binding);
        self
    }

    /// All clusters
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// All bindings
    pub fn bindings(&self) -> impl Iterator<Item = &ClusterBinding> {
        self.bindings.values()
    }
}

#[async_trait]
impl ClusterDirectory for InMemoryRegistry {
    async fn resolve(&self, name: &str) -> std::result::Result<Cluster, DirectoryError> {
        self.clusters
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(name.to_string()))
    }
}

#[async_trait]
impl BindingResolver for InMemoryRegistry {
    async fn resolve_binding(
        &self,
        cluster: &str,
        user: &str,
    ) -> std::result::Result<ClusterBinding, BindingError> {
        self.bindings
            .get(&(cluster.to_string(), user.to_string()))
            .cloned()
            .ok_or(BindingError::Unauthorized)
    }
}
