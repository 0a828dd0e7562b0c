//! Error types for the Kubernetes gateway

use std::io;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Response header carrying the gateway's own failure message.
///
/// The body stream is reserved for proxied payloads, so gateway-level
/// failures are described here instead.
pub const MESSAGE_HEADER: HeaderName = HeaderName::from_static("x-gateway-message");

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The cluster directory has no cluster with this name
    #[error("get cluster failed: cluster {0} not found")]
    ClusterNotFound(String),

    /// The cluster directory itself failed
    #[error("get cluster failed: {0}")]
    DirectoryUnavailable(String),

    /// No binding exists for the (cluster, user) pair
    #[error("user {user} not cluster {cluster} member")]
    NotAMember {
        /// Caller user name
        user: String,
        /// Target cluster name
        cluster: String,
    },

    /// The forwarded path would climb out of the routed prefix
    #[error("invalid forward path: {0}")]
    InvalidPath(String),

    /// The registered API server URL does not parse
    #[error("parse cluster api server failed: {0}")]
    BadUpstreamUrl(String),

    /// Certificate / key material could not be turned into a transport
    #[error("build cluster transport failed: {0}")]
    TransportConstruction(String),

    /// The upstream API server could not be reached
    #[error("upstream request failed: {0}")]
    UpstreamUnreachable(String),

    /// Connecting to the upstream API server timed out
    #[error("upstream request timed out: {0}")]
    UpstreamTimeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status reported to the caller for this error.
    ///
    /// `NotAMember` is the only gateway error answered with 403 and
    /// `InvalidPath` the only one blamed on the caller's request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotAMember { .. } => StatusCode::FORBIDDEN,
            Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Config(_)
            | Self::ClusterNotFound(_)
            | Self::DirectoryUnavailable(_)
            | Self::BadUpstreamUrl(_)
            | Self::TransportConstruction(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classify a failed upstream exchange the way a reverse proxy reports it.
    #[must_use]
    pub fn from_upstream(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else {
            Self::UpstreamUnreachable(err.to_string())
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = status.into_response();
        if let Ok(value) = HeaderValue::from_str(&header_safe(&self.to_string())) {
            response.headers_mut().insert(MESSAGE_HEADER, value);
        }
        response
    }
}

/// Replace anything a header value cannot carry.
fn header_safe(message: &str) -> String {
    message
        .chars()
        .map(|c| if c == ' ' || c.is_ascii_graphic() { c } else { '?' })
        .collect()
}
