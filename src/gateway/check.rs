//! Offline validation of every configured binding

use crate::config::Config;
use crate::registry::{BindingRecord, FileRegistry, RegistryDocument};
use crate::transport::{TransportOptions, TransportSpec, build, parse_api_server};
use crate::{Error, Result};

/// Outcome of building the transport for one binding
#[derive(Debug)]
pub struct BindingCheck {
    /// Cluster name
    pub cluster: String,
    /// User name
    pub user: String,
    /// `Ok` if a transport could be built
    pub result: Result<()>,
}

/// Build a transport for every binding in the configured registry.
///
/// Nothing is sent upstream; this only proves the material is usable.
///
/// # Errors
///
/// Returns `Error::Config` if the registry file cannot be read.
pub async fn check_bindings(config: &Config) -> Result<Vec<BindingCheck>> {
    let doc = match &config.registry.file {
        Some(path) => FileRegistry::new(path).load().await.map_err(Error::Config)?,
        None => config.registry.inline_document(),
    };
    let options = config.upstream.transport_options();

    let mut checks = Vec::with_capacity(doc.bindings.len());
    for record in &doc.bindings {
        checks.push(BindingCheck {
            cluster: record.cluster.clone(),
            user: record.user.clone(),
            result: check_one(&doc, record, &options).await,
        });
    }
    Ok(checks)
}

async fn check_one(
    doc: &RegistryDocument,
    record: &BindingRecord,
    options: &TransportOptions,
) -> Result<()> {
    let cluster = doc
        .clusters
        .get(&record.cluster)
        .ok_or_else(|| Error::ClusterNotFound(record.cluster.clone()))?
        .load(&record.cluster)
        .await?;
    let binding = record.load().await?;
    let api_server = parse_api_server(&cluster.api_server)?;
    build(&TransportSpec::new(&cluster, &binding, &api_server), options)?;
    Ok(())
}
