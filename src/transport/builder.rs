//! Transport construction: rustls client identity + reqwest client.

use std::sync::Arc;

use reqwest::redirect;
use rustls::ClientConfig;
use rustls::crypto::aws_lc_rs;
use tracing::debug;

use super::material::{self, common_name, ensure_key_matches};
use super::{
    AcceptAnyServerCert, ScopedTransport, ServerVerification, TransportOptions, TransportSpec,
};
use crate::{Error, Result};

/// Build a transport presenting `spec`'s client certificate.
///
/// Parses and cross-checks the material, then assembles the client. No
/// network I/O happens here.
///
/// # Errors
///
/// Returns `Error::TransportConstruction` if the certificate or key is empty,
/// malformed or mismatched, if `cluster-ca` verification is configured but
/// the cluster has no CA, or if the client cannot be assembled.
pub fn build(spec: &TransportSpec<'_>, options: &TransportOptions) -> Result<ScopedTransport> {
    let certs = material::parse_certificates(spec.client_cert, "client certificate")?;
    let key = material::parse_private_key(spec.client_key)?;

    let provider = Arc::new(aws_lc_rs::default_provider());
    ensure_key_matches(&provider, &certs[0], &key)?;

    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TransportConstruction(format!("TLS protocol setup: {e}")))?;

    let builder = match options.server_verification {
        ServerVerification::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new(Arc::clone(
                &provider,
            )))),
        ServerVerification::ClusterCa => {
            let ca = spec.ca_cert.filter(|ca| !ca.is_empty()).ok_or_else(|| {
                Error::TransportConstruction(format!(
                    "cluster {} has no CA bundle for server verification",
                    spec.cluster
                ))
            })?;
            builder.with_root_certificates(material::root_store(ca)?)
        }
    };

    let subject = common_name(&certs[0]);
    let mut tls = builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::TransportConstruction(format!("client identity rejected: {e}")))?;
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];

    let mut client = reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .http1_only()
        .redirect(redirect::Policy::none())
        .no_proxy()
        .tcp_keepalive(options.tcp_keepalive)
        .pool_idle_timeout(options.pool_idle_timeout);
    if let Some(timeout) = options.connect_timeout {
        client = client.connect_timeout(timeout);
    }
    let client = client
        .build()
        .map_err(|e| Error::TransportConstruction(format!("HTTP client: {e}")))?;

    debug!(
        cluster = spec.cluster,
        user = spec.user,
        api_server = %spec.api_server,
        subject = subject.as_deref().unwrap_or("-"),
        verification = ?options.server_verification,
        "Transport built"
    );

    Ok(ScopedTransport::new(
        spec.cluster,
        spec.user,
        spec.api_server.clone(),
        client,
    ))
}
