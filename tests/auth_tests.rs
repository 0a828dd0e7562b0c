//! End-to-end authentication tests
//!
//! Tests the caller identity flow through the real router:
//! - API keys mapped to users
//! - Trusted identity header
//! - Anonymous mode
//! - Rate limiting and public paths

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use kube_gateway::config::{ApiKeyConfig, AuthConfig, Config};
use kube_gateway::gateway::Gateway;
use kube_gateway::registry::InMemoryRegistry;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use common::{Pki, Upstream, spawn_plain_upstream};

async fn gateway(auth: AuthConfig) -> (Gateway, Upstream) {
    let pki = Pki::new("demo");
    let upstream = Upstream::default();
    let addr = spawn_plain_upstream(upstream.router()).await;
    let registry = Arc::new(
        InMemoryRegistry::new()
            .with_cluster(pki.cluster("demo", &format!("http://{addr}")))
            .with_binding(pki.binding("demo", "alice"))
            .with_binding(pki.binding("demo", "anonymous")),
    );
    let config = Config {
        auth,
        ..Config::default()
    };
    let gateway = Gateway::with_registry(config, Arc::clone(&registry) as _, registry).unwrap();
    (gateway, upstream)
}

fn api_keys(rate_limit: u32) -> AuthConfig {
    AuthConfig {
        enabled: true,
        api_keys: vec![
            ApiKeyConfig {
                key: "alice-key".to_string(),
                user: "alice".to_string(),
                rate_limit,
            },
            ApiKeyConfig {
                key: "bob-key".to_string(),
                user: "bob".to_string(),
                rate_limit: 0,
            },
        ],
        ..AuthConfig::default()
    }
}

fn get(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_api_key_authenticates_as_its_user() {
    let (gateway, upstream) = gateway(api_keys(0)).await;

    let response = gateway
        .router()
        .oneshot(get("/proxy/demo/k8s/api/v1/namespaces", Some("alice-key")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let seen = upstream.last();
    assert_eq!(seen.uri, "/api/v1/namespaces");
    // The caller's key never reaches the cluster
    assert!(seen.headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_key_for_unbound_user_is_forbidden() {
    let (gateway, upstream) = gateway(api_keys(0)).await;

    let response = gateway
        .router()
        .oneshot(get("/proxy/demo/k8s/api", Some("bob-key")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response.headers()["x-gateway-message"],
        "user bob not cluster demo member"
    );
    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn test_missing_and_invalid_credentials_are_401() {
    let (gateway, upstream) = gateway(api_keys(0)).await;

    let missing = gateway
        .router()
        .oneshot(get("/proxy/demo/k8s/api", None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(missing.headers()["www-authenticate"], "Bearer");
    assert!(missing.headers().contains_key("x-gateway-message"));

    let invalid = gateway
        .router()
        .oneshot(get("/proxy/demo/k8s/api", Some("nope")))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(invalid.headers()["x-gateway-message"], "invalid token");

    assert!(upstream.requests().is_empty());
}

#[tokio::test]
async fn test_health_is_public() {
    let (gateway, _) = gateway(api_keys(0)).await;

    let response = gateway.router().oneshot(get("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(health["transports"]["builds"], 0);
    assert_eq!(health["transports"]["cache"]["size"], 0);
}

#[tokio::test]
async fn test_rate_limit_is_per_user() {
    let (gateway, _) = gateway(api_keys(2)).await;
    let router = gateway.router();

    for _ in 0..2 {
        let response = router
            .clone()
            .oneshot(get("/proxy/demo/k8s/api", Some("alice-key")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = router
        .clone()
        .oneshot(get("/proxy/demo/k8s/api", Some("alice-key")))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers()["retry-after"], "60");

    // bob has no limit and is unaffected
    let bob = router
        .oneshot(get("/proxy/demo/k8s/api", Some("bob-key")))
        .await
        .unwrap();
    assert_eq!(bob.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_disabled_auth_uses_anonymous_user() {
    let (gateway, upstream) = gateway(AuthConfig {
        enabled: false,
        ..AuthConfig::default()
    })
    .await;

    let response = gateway
        .router()
        .oneshot(get("/proxy/demo/k8s/version", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(upstream.last().uri, "/version");
}

#[tokio::test]
async fn test_trusted_header_identity() {
    let (gateway, upstream) = gateway(AuthConfig {
        enabled: true,
        trusted_header: Some("X-Remote-User".to_string()),
        ..AuthConfig::default()
    })
    .await;

    let request = Request::builder()
        .uri("/proxy/demo/k8s/api")
        .header("x-remote-user", "alice")
        .body(Body::empty())
        .unwrap();
    let response = gateway.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(upstream.last().headers.get("x-remote-user").is_none());
}

#[tokio::test]
async fn test_gateway_refuses_unresolvable_env_api_key() {
    let registry = Arc::new(InMemoryRegistry::new());
    let config = Config {
        auth: AuthConfig {
            enabled: true,
            api_keys: vec![ApiKeyConfig {
                key: "env:KUBE_GW_TEST_UNSET_GATEWAY_KEY".to_string(),
                user: "alice".to_string(),
                rate_limit: 0,
            }],
            ..AuthConfig::default()
        },
        ..Config::default()
    };

    assert!(config.validate().is_err());
    assert!(Gateway::with_registry(config, Arc::clone(&registry) as _, registry).is_err());
}
