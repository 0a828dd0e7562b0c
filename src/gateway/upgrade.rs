//! Protocol upgrade splicing (`kubectl exec`, `attach`, `port-forward`)

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use super::rewrite::upgrade_response_headers;
use crate::{Error, Result};

/// Answer the caller with `101` and splice both upgraded connections.
///
/// The splice runs in its own task until either side closes.
///
/// # Errors
///
/// Returns `Error::Internal` if the caller's connection cannot be upgraded.
pub fn splice(
    client: Option<OnUpgrade>,
    upstream: reqwest::Response,
    cluster: &str,
    user: &str,
) -> Result<Response> {
    let Some(client) = client else {
        return Err(Error::Internal(
            "upstream switched protocols but the caller connection cannot be upgraded"
                .to_string(),
        ));
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = upgrade_response_headers(upstream.headers());

    let cluster = cluster.to_string();
    let user = user.to_string();
    tokio::spawn(async move {
        let mut upstream_io = match upstream.upgrade().await {
            Ok(io) => io,
            Err(e) => {
                warn!(cluster = %cluster, user = %user, error = %e, "Upstream upgrade failed");
                return;
            }
        };
        let mut client_io = match client.await {
            Ok(io) => TokioIo::new(io),
            Err(e) => {
                warn!(cluster = %cluster, user = %user, error = %e, "Caller upgrade failed");
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((from_caller, from_upstream)) => debug!(
                cluster = %cluster,
                user = %user,
                from_caller,
                from_upstream,
                "Upgraded connection closed"
            ),
            Err(e) => debug!(
                cluster = %cluster,
                user = %user,
                error = %e,
                "Upgraded connection ended"
            ),
        }
    });

    Ok(response)
}
