//! Kubernetes Gateway Library
//!
//! Multi-tenant gateway in front of many managed Kubernetes API servers.
//! Callers reach `/proxy/{cluster}/k8s/{path}`; the gateway looks up the
//! caller's binding to that cluster and forwards the request over a
//! transport authenticated with the caller's own client certificate.
//!
//! # Features
//!
//! - **Per-user identity**: every upstream connection presents the binding's
//!   certificate, so the API server sees the real user
//! - **Transport cache**: one connection pool per (cluster, user), rebuilt
//!   when material rotates
//! - **Streaming**: watch responses and request bodies are never buffered
//! - **Upgrades**: `exec`/`attach`/`port-forward` sessions are spliced
//!   through after the 101 handshake
//! - **Production Ready**: API key auth, rate limits, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns `Error::Internal` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
