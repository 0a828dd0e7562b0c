//! Serialized registry records.
//!
//! Key and certificate material is given either inline (PEM text) or as a
//! path to a file. File material is read at load time, so raw DER keys are
//! possible only through `*_file` fields.
//!
//! ```yaml
//! clusters:
//!   demo-cluster:
//!     api_server: "https://10.0.0.5:6443"
//!     private_key_file: "keys/demo-cluster.key"
//!     ca_cert_file: "keys/demo-cluster-ca.crt"
//! bindings:
//!   - cluster: demo-cluster
//!     user: alice
//!     certificate_file: "certs/alice@demo-cluster.crt"
//! ```

use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Cluster, ClusterBinding};

/// Full registry contents: clusters and the user bindings against them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDocument {
    /// Clusters keyed by name
    pub clusters: HashMap<String, ClusterRecord>,
    /// User bindings
    pub bindings: Vec<BindingRecord>,
}

/// One cluster entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterRecord {
    /// Upstream API server base URL
    pub api_server: String,
    /// Inline PEM signing key
    pub private_key: Option<String>,
    /// Path to the signing key (PEM or raw PKCS#1 DER)
    pub private_key_file: Option<String>,
    /// Inline PEM CA bundle for the API server
    pub ca_cert: Option<String>,
    /// Path to the PEM CA bundle for the API server
    pub ca_cert_file: Option<String>,
}

/// One (cluster, user) binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingRecord {
    /// Cluster name
    pub cluster: String,
    /// User name
    pub user: String,
    /// Inline PEM client certificate
    pub certificate: Option<String>,
    /// Path to the PEM client certificate
    pub certificate_file: Option<String>,
}

impl RegistryDocument {
    /// Parse a registry document from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Find the binding of `user` to `cluster`.
    #[must_use]
    pub fn find_binding(&self, cluster: &str, user: &str) -> Option<&BindingRecord> {
        self.bindings
            .iter()
            .find(|b| b.cluster == cluster && b.user == user)
    }

    /// Resolve relative `*_file` paths against `dir`.
    pub fn rebase(&mut self, dir: &Path) {
        for record in self.clusters.values_mut() {
            rebase_path(&mut record.private_key_file, dir);
            rebase_path(&mut record.ca_cert_file, dir);
        }
        for record in &mut self.bindings {
            rebase_path(&mut record.certificate_file, dir);
        }
    }
}

impl ClusterRecord {
    /// Materialize the cluster, reading any referenced files.
    pub async fn load(&self, name: &str) -> io::Result<Cluster> {
        let private_key = material(
            self.private_key.as_deref(),
            self.private_key_file.as_deref(),
        )
        .await?
        .ok_or_else(|| missing(&format!("cluster {name} has no private key")))?;

        let ca_cert = material(self.ca_cert.as_deref(), self.ca_cert_file.as_deref()).await?;

        Ok(Cluster {
            name: name.to_string(),
            api_server: self.api_server.clone(),
            private_key,
            ca_cert,
        })
    }
}

impl BindingRecord {
    /// Materialize the binding, reading any referenced files.
    pub async fn load(&self) -> io::Result<ClusterBinding> {
        let certificate = material(self.certificate.as_deref(), self.certificate_file.as_deref())
            .await?
            .ok_or_else(|| {
                missing(&format!(
                    "binding {}@{} has no certificate",
                    self.user, self.cluster
                ))
            })?;

        Ok(ClusterBinding {
            cluster: self.cluster.clone(),
            user: self.user.clone(),
            certificate,
        })
    }
}

/// Inline material wins over a file reference.
async fn material(inline: Option<&str>, file: Option<&str>) -> io::Result<Option<Vec<u8>>> {
    if let Some(text) = inline.filter(|t| !t.trim().is_empty()) {
        return Ok(Some(text.as_bytes().to_vec()));
    }
    match file.filter(|p| !p.is_empty()) {
        Some(path) => tokio::fs::read(path)
            .await
            .map(Some)
            .map_err(|e| io::Error::new(e.kind(), format!("cannot read '{path}': {e}"))),
        None => Ok(None),
    }
}

fn missing(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

fn rebase_path(path: &mut Option<String>, dir: &Path) {
    if let Some(p) = path.as_mut() {
        if Path::new(p.as_str()).is_relative() {
            *p = dir.join(p.as_str()).to_string_lossy().into_owned();
        }
    }
}
