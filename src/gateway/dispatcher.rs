//! Request dispatch: resolve, authorize, build transport, forward
//!
//! ```text
//! caller ──► resolve cluster ──► resolve binding ──► obtain transport
//!                │ 500               │ 403               │ 500
//!                ▼                   ▼                   ▼
//!            (stop)              (stop)              (stop)
//!
//!        ──► rewrite headers ──► stream to API server ──► filter status ──► caller
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, HttpBody};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use tracing::{debug, error, warn};

use super::auth::UserIdentity;
use super::rewrite::{self, ProxyTarget, RequestRewrites};
use super::upgrade;
use crate::registry::{BindingError, BindingResolver, ClusterDirectory, DirectoryError};
use crate::transport::{TransportProvider, parse_api_server};
use crate::{Error, Result};

/// Forwards authorized requests to the matching cluster as the calling user.
pub struct Dispatcher {
    directory: Arc<dyn ClusterDirectory>,
    bindings: Arc<dyn BindingResolver>,
    transports: Arc<TransportProvider>,
    rewrites: RequestRewrites,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        bindings: Arc<dyn BindingResolver>,
        transports: Arc<TransportProvider>,
        rewrites: RequestRewrites,
    ) -> Self {
        Self {
            directory,
            bindings,
            transports,
            rewrites,
        }
    }

    /// Transport provider (for statistics)
    #[must_use]
    pub fn transports(&self) -> &TransportProvider {
        &self.transports
    }

    /// Forward `request` to `target` as `identity`.
    ///
    /// Never fails: gateway errors become responses carrying their status
    /// and message header.
    pub async fn dispatch(
        &self,
        target: ProxyTarget,
        identity: &UserIdentity,
        peer: Option<SocketAddr>,
        request: Request<Body>,
    ) -> Response {
        let method = request.method().clone();
        match self.forward(&target, identity, peer, request).await {
            Ok(response) => {
                debug!(
                    cluster = %target.cluster,
                    user = %identity,
                    method = %method,
                    path = %target.forward_path,
                    status = response.status().as_u16(),
                    "Proxied request"
                );
                response
            }
            Err(e) => {
                match &e {
                    Error::NotAMember { .. } => {}
                    Error::InvalidPath(_) => warn!(
                        cluster = %target.cluster,
                        user = %identity,
                        method = %method,
                        path = %target.forward_path,
                        "Rejected path with dot segments"
                    ),
                    Error::UpstreamUnreachable(_) | Error::UpstreamTimeout(_) => warn!(
                        cluster = %target.cluster,
                        user = %identity,
                        method = %method,
                        path = %target.forward_path,
                        error = %e,
                        "Upstream request failed"
                    ),
                    _ => error!(
                        cluster = %target.cluster,
                        user = %identity,
                        method = %method,
                        path = %target.forward_path,
                        error = %e,
                        "Request not forwarded"
                    ),
                }
                e.into_response()
            }
        }
    }

    async fn forward(
        &self,
        target: &ProxyTarget,
        identity: &UserIdentity,
        peer: Option<SocketAddr>,
        request: Request<Body>,
    ) -> Result<Response> {
        let cluster = self
            .directory
            .resolve(&target.cluster)
            .await
            .map_err(|e| match e {
                DirectoryError::NotFound(name) => Error::ClusterNotFound(name),
                DirectoryError::Unavailable(reason) => Error::DirectoryUnavailable(reason),
            })?;

        let binding = match self
            .bindings
            .resolve_binding(&cluster.name, identity.name())
            .await
        {
            Ok(binding) => binding,
            Err(BindingError::Unauthorized) => {
                warn!(cluster = %cluster.name, user = %identity, "User is not a cluster member");
                return Err(not_a_member(identity, &cluster.name));
            }
            Err(BindingError::Unavailable(reason)) => {
                error!(
                    cluster = %cluster.name,
                    user = %identity,
                    error = %reason,
                    "Binding lookup failed"
                );
                return Err(not_a_member(identity, &cluster.name));
            }
        };

        let api_server = parse_api_server(&cluster.api_server)?;
        let transport = self.transports.obtain(&cluster, &binding, &api_server).await?;
        let url = transport.target_url(&target.forward_path, target.query.as_deref())?;

        let (mut parts, body) = request.into_parts();
        let upgrade_to = rewrite::upgrade_protocol(&parts.headers).cloned();
        let on_upgrade = upgrade_to
            .as_ref()
            .and_then(|_| parts.extensions.remove::<OnUpgrade>());
        let headers = self.rewrites.outgoing_headers(
            &parts.method,
            &parts.headers,
            peer.map(|p| p.ip()),
            upgrade_to.as_ref(),
        );

        let mut outgoing = transport
            .client()
            .request(parts.method, url)
            .headers(headers);
        if !body.is_end_stream() {
            outgoing = outgoing.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = outgoing
            .send()
            .await
            .map_err(|e| Error::from_upstream(&e))?;

        let status = upstream.status();
        if status == StatusCode::SWITCHING_PROTOCOLS {
            return upgrade::splice(on_upgrade, upstream, transport.cluster(), transport.user());
        }

        let reported = rewrite::filter_status(status);
        if reported != status {
            debug!(
                cluster = %cluster.name,
                user = %identity,
                upstream_status = status.as_u16(),
                status = reported.as_u16(),
                "Rewrote upstream status"
            );
        }

        let headers = rewrite::strip_hop_by_hop(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = reported;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn not_a_member(identity: &UserIdentity, cluster: &str) -> Error {
    Error::NotAMember {
        user: identity.name().to_string(),
        cluster: cluster.to_string(),
    }
}
