//! Cluster directory and binding resolver.
//!
//! The gateway never owns cluster or binding records; it only looks them up
//! through two narrow contracts:
//!
//! - [`ClusterDirectory`]: cluster name → upstream endpoint + signing key
//! - [`BindingResolver`]: (cluster, user) → that user's client certificate
//!
//! The existence of a binding is the authorization predicate: no binding,
//! no forwarding.
//!
//! Two implementations are provided:
//!
//! - [`InMemoryRegistry`]: records loaded once from configuration
//! - [`FileRegistry`]: a YAML registry file re-read on every lookup, so
//!   records can be rotated without restarting the gateway

mod file;
mod memory;
mod record;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileRegistry;
pub use memory::InMemoryRegistry;
pub use record::{BindingRecord, ClusterRecord, RegistryDocument};

/// A managed Kubernetes control plane the gateway can forward to.
#[derive(Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Unique cluster name
    pub name: String,
    /// Upstream API server base URL (e.g. `https://10.0.0.5:6443`)
    pub api_server: String,
    /// Cluster signing key: PEM, or raw PKCS#1 DER for RSA keys
    pub private_key: Vec<u8>,
    /// PEM bundle used to verify the API server certificate
    pub ca_cert: Option<Vec<u8>>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("api_server", &self.api_server)
            .field("private_key", &"<redacted>")
            .field("ca_cert", &self.ca_cert.as_ref().map(Vec::len))
            .finish()
    }
}

/// Authorization record: `user` may act against `cluster` with `certificate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBinding {
    /// Cluster name
    pub cluster: String,
    /// User name
    pub user: String,
    /// PEM-encoded client certificate (chain)
    pub certificate: Vec<u8>,
}

/// Cluster lookup failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DirectoryError {
    /// No cluster with this name exists
    #[error("cluster {0} not found")]
    NotFound(String),
    /// The backing store failed
    #[error("cluster directory unavailable: {0}")]
    Unavailable(String),
}

/// Binding lookup failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindingError {
    /// No binding exists: the user is not a member of the cluster
    #[error("no binding")]
    Unauthorized,
    /// The backing store failed
    #[error("binding store unavailable: {0}")]
    Unavailable(String),
}

/// Resolves cluster names to connection metadata.
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Look up a cluster by name.
    async fn resolve(&self, name: &str) -> Result<Cluster, DirectoryError>;
}

/// Resolves (cluster, user) pairs to client certificates.
#[async_trait]
pub trait BindingResolver: Send + Sync {
    /// Look up the binding of `user` to `cluster`.
    ///
    /// Returns [`BindingError::Unauthorized`] whenever no binding exists;
    /// that is the authorization decision, not an incidental failure.
    async fn resolve_binding(&self, cluster: &str, user: &str)
    -> Result<ClusterBinding, BindingError>;
}
