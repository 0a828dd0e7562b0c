//! Certificate and key material parsing.
//!
//! Client certificates and CA bundles are PEM. Cluster signing keys are PEM
//! (`RSA PRIVATE KEY`, `PRIVATE KEY`, `EC PRIVATE KEY`) or raw DER; raw DER
//! is taken to be a PKCS#1 RSA key, which is how cluster registries usually
//! store the bytes.

use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Parse every certificate from a PEM bundle.
///
/// # Errors
///
/// Returns `Error::TransportConstruction` if the PEM is malformed or holds no
/// certificate.
pub fn parse_certificates(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::TransportConstruction(format!("malformed {what}: {e}")))?;

    if certs.is_empty() {
        return Err(Error::TransportConstruction(format!(
            "no certificate found in {what}"
        )));
    }

    Ok(certs)
}

/// Parse a private key from PEM or raw PKCS#1 DER.
///
/// # Errors
///
/// Returns `Error::TransportConstruction` if no key can be read.
pub fn parse_private_key(material: &[u8]) -> Result<PrivateKeyDer<'static>> {
    if material.is_empty() {
        return Err(Error::TransportConstruction("empty private key".to_string()));
    }

    if !is_pem(material) {
        return Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(
            material.to_vec(),
        )));
    }

    rustls_pemfile::private_key(&mut &material[..])
        .map_err(|e| Error::TransportConstruction(format!("malformed private key: {e}")))?
        .ok_or_else(|| Error::TransportConstruction("no private key found in PEM".to_string()))
}

/// Build a trust store from a PEM CA bundle.
///
/// # Errors
///
/// Returns `Error::TransportConstruction` if the bundle is empty or a
/// certificate is rejected by the store.
pub fn root_store(ca_pem: &[u8]) -> Result<RootCertStore> {
    let mut store = RootCertStore::empty();
    for cert in parse_certificates(ca_pem, "cluster CA bundle")? {
        store.add(cert).map_err(|e| {
            Error::TransportConstruction(format!("cluster CA rejected by trust store: {e}"))
        })?;
    }
    Ok(store)
}

/// Check that `key` is the private half of the key certified by `cert`.
///
/// Catches a binding certificate issued for a different key before any
/// handshake is attempted.
///
/// # Errors
///
/// Returns `Error::TransportConstruction` if the key is unusable or does not
/// match the certificate.
pub fn ensure_key_matches(
    provider: &CryptoProvider,
    cert: &CertificateDer<'_>,
    key: &PrivateKeyDer<'static>,
) -> Result<()> {
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| Error::TransportConstruction(format!("unusable private key: {e}")))?;

    // Providers that cannot derive the public half skip the check;
    // the handshake will still fail on a mismatch.
    let Some(spki) = signing_key.public_key() else {
        return Ok(());
    };

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).map_err(|e| {
        Error::TransportConstruction(format!("malformed client certificate: {e}"))
    })?;

    if parsed.public_key().raw != spki.as_ref() {
        return Err(Error::TransportConstruction(
            "client certificate does not match the cluster private key".to_string(),
        ));
    }

    Ok(())
}

/// Extract the subject common name, for logs.
#[must_use]
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn is_pem(material: &[u8]) -> bool {
    material
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .is_some_and(|start| material[start..].starts_with(b"-----BEGIN"))
}
