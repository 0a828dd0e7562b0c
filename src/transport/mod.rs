//! Per-user upstream transports
//!
//! A [`ScopedTransport`] is an HTTP client bound to exactly one
//! `(cluster, user)` pair: it presents that user's client certificate (signed
//! by the cluster CA, keyed with the cluster's signing key) and talks to one
//! API server base URL. [`TransportProvider`] hands them out, optionally
//! through the [`TransportCache`].

mod builder;
mod cache;
pub mod material;
mod verifier;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

pub use builder::build;
pub use cache::{CacheKey, CacheStatsSnapshot, TransportCache};
pub use verifier::AcceptAnyServerCert;

use crate::registry::{Cluster, ClusterBinding};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// How the upstream API server certificate is checked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerVerification {
    /// Verify against the cluster's registered CA bundle
    #[default]
    ClusterCa,
    /// Accept any server certificate
    Insecure,
}

/// Settings shared by every transport the gateway builds
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upstream certificate verification mode
    pub server_verification: ServerVerification,
    /// TCP + TLS connect timeout (no overall request timeout is ever set)
    pub connect_timeout: Option<Duration>,
    /// TCP keepalive interval
    pub tcp_keepalive: Option<Duration>,
    /// How long idle pooled connections are kept
    pub pool_idle_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            server_verification: ServerVerification::default(),
            connect_timeout: Some(Duration::from_secs(10)),
            tcp_keepalive: Some(Duration::from_secs(30)),
            pool_idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Build input
// ─────────────────────────────────────────────────────────────────────────────

/// Everything needed to build one transport.
#[derive(Clone, Copy)]
pub struct TransportSpec<'a> {
    /// Cluster name
    pub cluster: &'a str,
    /// User name
    pub user: &'a str,
    /// Parsed API server base URL
    pub api_server: &'a Url,
    /// PEM client certificate (chain)
    pub client_cert: &'a [u8],
    /// Cluster signing key, PEM or raw PKCS#1 DER
    pub client_key: &'a [u8],
    /// PEM CA bundle for the API server
    pub ca_cert: Option<&'a [u8]>,
}

impl<'a> TransportSpec<'a> {
    /// Assemble the build input for `binding` against `cluster`.
    #[must_use]
    pub fn new(cluster: &'a Cluster, binding: &'a ClusterBinding, api_server: &'a Url) -> Self {
        Self {
            cluster: &cluster.name,
            user: &binding.user,
            api_server,
            client_cert: &binding.certificate,
            client_key: &cluster.private_key,
            ca_cert: cluster.ca_cert.as_deref(),
        }
    }

    /// SHA-256 over every input that shapes the transport.
    ///
    /// A cached transport is reused only while this is unchanged.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.api_server.as_str().as_bytes(),
            self.client_cert,
            self.client_key,
            self.ca_cert.unwrap_or_default(),
        ] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for TransportSpec<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSpec")
            .field("cluster", &self.cluster)
            .field("user", &self.user)
            .field("api_server", &self.api_server.as_str())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scoped transport
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP client bound to one `(cluster, user)` pair and one API server.
#[derive(Debug, Clone)]
pub struct ScopedTransport {
    cluster: String,
    user: String,
    base_url: Url,
    client: reqwest::Client,
}

impl ScopedTransport {
    pub(crate) fn new(
        cluster: impl Into<String>,
        user: impl Into<String>,
        base_url: Url,
        client: reqwest::Client,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            user: user.into(),
            base_url,
            client,
        }
    }

    /// Cluster this transport talks to
    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// User whose certificate this transport presents
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// API server base URL
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Underlying client
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Upstream URL for `forward_path` (raw, percent-encoded) and `query`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPath` if `forward_path` has dot segments.
    pub fn target_url(&self, forward_path: &str, query: Option<&str>) -> Result<Url> {
        join_url(&self.base_url, forward_path, query)
    }
}

/// Parse a registered API server URL.
///
/// # Errors
///
/// Returns `Error::BadUpstreamUrl` unless the URL is absolute `http`/`https`
/// with a host.
pub fn parse_api_server(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| Error::BadUpstreamUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::BadUpstreamUrl(format!(
            "{raw}: unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::BadUpstreamUrl(format!("{raw}: missing host")));
    }
    Ok(url)
}

/// Join `path` onto `base`, keeping the base path and merging queries.
///
/// Exactly one slash separates the base path from `path`; the base query
/// (if any) comes first.
///
/// `Url` resolves `.` and `..` segments on assignment, which would let a
/// forwarded path escape the base path, so paths carrying them (literal or
/// percent-encoded) are refused instead of rewritten.
///
/// # Errors
///
/// Returns `Error::InvalidPath` if `path` has a `.` or `..` segment.
pub fn join_url(base: &Url, path: &str, query: Option<&str>) -> Result<Url> {
    if path.split(['/', '\\']).any(is_dot_segment) {
        return Err(Error::InvalidPath(path.to_string()));
    }

    let mut url = base.clone();
    url.set_path(&single_joining_slash(base.path(), path));

    let merged = match (base.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
        (Some(a), Some(b)) => Some(format!("{a}&{b}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    };
    url.set_query(merged.as_deref());
    url.set_fragment(None);
    Ok(url)
}

fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider
// ─────────────────────────────────────────────────────────────────────────────

/// Builds transports, through the cache when one is configured.
pub struct TransportProvider {
    options: TransportOptions,
    cache: Option<Arc<TransportCache>>,
    builds: AtomicU64,
}

impl TransportProvider {
    /// Create a provider; `cache: None` builds a fresh transport per request.
    #[must_use]
    pub fn new(options: TransportOptions, cache: Option<Arc<TransportCache>>) -> Self {
        Self {
            options,
            cache,
            builds: AtomicU64::new(0),
        }
    }

    /// Transport options
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// The cache, if enabled
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<TransportCache>> {
        self.cache.as_ref()
    }

    /// Number of transports built so far
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Get a transport for `binding` against `cluster`.
    ///
    /// # Errors
    ///
    /// Returns `Error::TransportConstruction` if the material is unusable.
    pub async fn obtain(
        &self,
        cluster: &Cluster,
        binding: &ClusterBinding,
        api_server: &Url,
    ) -> Result<Arc<ScopedTransport>> {
        let spec = TransportSpec::new(cluster, binding, api_server);
        let make = || {
            self.builds.fetch_add(1, Ordering::Relaxed);
            debug!(cluster = spec.cluster, user = spec.user, "Building transport");
            build(&spec, &self.options)
        };

        match &self.cache {
            Some(cache) => {
                let key = CacheKey::new(spec.cluster, spec.user);
                cache.get_or_build(key, &spec.fingerprint(), make).await
            }
            None => make().map(Arc::new),
        }
    }

    /// Statistics for `/health`
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            builds: self.builds(),
            cache: self.cache.as_ref().map(|c| c.stats()),
        }
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    /// Transports built so far
    pub builds: u64,
    /// Cache statistics, when the cache is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStatsSnapshot>,
}
