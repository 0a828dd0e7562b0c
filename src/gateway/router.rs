//! HTTP router and handlers

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::auth::{ResolvedAuthConfig, UserIdentity, auth_middleware};
use super::dispatcher::Dispatcher;
use super::rewrite::ProxyTarget;

/// Shared application state
pub struct AppState {
    /// Request dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Authentication configuration
    pub auth_config: Arc<ResolvedAuthConfig>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_config = Arc::clone(&state.auth_config);

    Router::new()
        .route("/health", get(health_handler))
        .route("/proxy/{cluster}/k8s", any(proxy_handler))
        .route("/proxy/{cluster}/k8s/{*path}", any(proxy_handler))
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth_config, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ProxyParams {
    cluster: String,
}

/// Any method on `/proxy/{cluster}/k8s/{*path}`
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(params): Path<ProxyParams>,
    Extension(identity): Extension<UserIdentity>,
    request: Request<Body>,
) -> Response {
    let target = ProxyTarget::from_uri(params.cluster, request.uri());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    state
        .dispatcher
        .dispatch(target, &identity, peer, request)
        .await
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "transports": state.dispatcher.transports().stats(),
    }))
}
