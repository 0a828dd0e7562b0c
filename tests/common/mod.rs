//! Shared fixtures: throwaway PKI, in-process API servers, a running gateway

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Extension, Router};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

use kube_gateway::config::Config;
use kube_gateway::gateway::Gateway;
use kube_gateway::registry::{
    BindingError, BindingResolver, Cluster, ClusterBinding, ClusterDirectory, DirectoryError,
    InMemoryRegistry,
};
use kube_gateway::transport::material;

/// Body returned by the fake API server for requests without a body
pub const NAMESPACE_LIST: &[u8] =
    br#"{"kind":"NamespaceList","apiVersion":"v1","items":[{"metadata":{"name":"default"}}]}"#;

// ─────────────────────────────────────────────────────────────────────────────
// PKI
// ─────────────────────────────────────────────────────────────────────────────

/// One cluster's certificate authority and signing key.
///
/// Every user certificate is issued for the shared cluster key, the way
/// the gateway expects bindings to be minted.
pub struct Pki {
    ca_key: KeyPair,
    ca: Certificate,
    cluster_key: KeyPair,
    server_cert: String,
    server_key: String,
}

impl Pki {
    pub fn new(cluster: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, format!("{cluster} CA"));
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        server_params
            .distinguished_name
            .push(DnType::CommonName, "kube-apiserver");
        let server_cert = server_params.signed_by(&server_key, &ca, &ca_key).unwrap();

        Self {
            ca_key,
            ca,
            cluster_key: KeyPair::generate().unwrap(),
            server_cert: server_cert.pem(),
            server_key: server_key.serialize_pem(),
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca.pem()
    }

    pub fn cluster_key_pem(&self) -> String {
        self.cluster_key.serialize_pem()
    }

    /// Client certificate with `CN=user` for the cluster key
    pub fn user_cert(&self, user: &str) -> String {
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, user);
        params
            .signed_by(&self.cluster_key, &self.ca, &self.ca_key)
            .unwrap()
            .pem()
    }

    pub fn cluster(&self, name: &str, api_server: &str) -> Cluster {
        Cluster {
            name: name.to_string(),
            api_server: api_server.to_string(),
            private_key: self.cluster_key_pem().into_bytes(),
            ca_cert: Some(self.ca_pem().into_bytes()),
        }
    }

    pub fn binding(&self, cluster: &str, user: &str) -> ClusterBinding {
        ClusterBinding {
            cluster: cluster.to_string(),
            user: user.to_string(),
            certificate: self.user_cert(user).into_bytes(),
        }
    }

    /// rustls config for an API server that requires client certificates
    fn server_config(&self) -> ServerConfig {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(self.ca.der().clone()).unwrap();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
                .build()
                .unwrap();

        let certs = material::parse_certificates(self.server_cert.as_bytes(), "server").unwrap();
        let key = material::parse_private_key(self.server_key.as_bytes()).unwrap();

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fake API server
// ─────────────────────────────────────────────────────────────────────────────

/// CN of the client certificate the connection was authenticated with
#[derive(Debug, Clone)]
pub struct PeerUser(pub Option<String>);

/// A request as the API server received it
#[derive(Debug, Clone)]
pub struct Seen {
    pub user: Option<String>,
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Records every request and answers like a tiny API server.
///
/// - `/status/{code}` answers with that status
/// - `/watch` streams events until the connection goes away
/// - `/exec` upgrades and echoes bytes back
/// - anything else echoes the request body (or a namespace list)
#[derive(Clone, Default)]
pub struct Upstream {
    seen: Arc<Mutex<Vec<Seen>>>,
    pub watch_closed: Arc<Notify>,
}

impl Upstream {
    pub fn router(&self) -> Router {
        Router::new()
            .route("/status/{code}", any(status))
            .route("/watch", get(watch))
            .route("/exec", any(exec))
            .fallback(echo)
            .with_state(self.clone())
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last(&self) -> Seen {
        self.requests().pop().expect("upstream saw no request")
    }

    async fn record(&self, user: Option<Extension<PeerUser>>, request: Request) -> Seen {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        let seen = Seen {
            user: user.and_then(|Extension(PeerUser(name))| name),
            method: parts.method,
            uri: parts.uri.to_string(),
            headers: parts.headers,
            body,
        };
        self.seen.lock().unwrap().push(seen.clone());
        seen
    }
}

async fn echo(
    State(upstream): State<Upstream>,
    user: Option<Extension<PeerUser>>,
    request: Request,
) -> Response {
    let seen = upstream.record(user, request).await;
    let body = if seen.body.is_empty() {
        Bytes::from_static(NAMESPACE_LIST)
    } else {
        seen.body
    };
    let mut response = (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::HeaderName::from_static("x-upstream-marker"), "kube"),
        ],
        body,
    )
        .into_response();
    if let Some(name) = seen.user.and_then(|u| HeaderValue::from_str(&u).ok()) {
        response.headers_mut().insert("x-upstream-user", name);
    }
    response
}

async fn status(
    State(upstream): State<Upstream>,
    Path(code): Path<u16>,
    user: Option<Extension<PeerUser>>,
    request: Request,
) -> Response {
    upstream.record(user, request).await;
    let status = StatusCode::from_u16(code).unwrap();
    (status, format!("status {code}")).into_response()
}

struct CloseGuard(Arc<Notify>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

async fn watch(
    State(upstream): State<Upstream>,
    user: Option<Extension<PeerUser>>,
    request: Request,
) -> Response {
    upstream.record(user, request).await;
    let closed = Arc::clone(&upstream.watch_closed);
    let events = async_stream::stream! {
        let _guard = CloseGuard(closed);
        let mut n = 0u64;
        loop {
            let event = format!("{{\"type\":\"ADDED\",\"object\":{{\"n\":{n}}}}}\n");
            yield Ok::<_, Infallible>(Bytes::from(event));
            n += 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    Response::new(Body::from_stream(events))
}

async fn exec(mut request: Request) -> Response {
    let Some(protocol) = request.headers().get(header::UPGRADE).cloned() else {
        return (StatusCode::BAD_REQUEST, "upgrade required").into_response();
    };
    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        let Ok(upgraded) = on_upgrade.await else {
            return;
        };
        let (mut reader, mut writer) = tokio::io::split(TokioIo::new(upgraded));
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        let _ = writer.shutdown().await;
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    response.headers_mut().insert(header::UPGRADE, protocol);
    response
}

/// Serve `app` over plain HTTP
pub async fn spawn_plain_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Serve `app` over TLS, requiring a client certificate issued by `pki`
pub async fn spawn_mtls_upstream(pki: &Pki, app: Router) -> SocketAddr {
    let acceptor = TlsAcceptor::from(Arc::new(pki.server_config()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            let app = app.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                let user = tls
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .and_then(|cert| material::common_name(cert));
                let service = TowerToHyperService::new(app.layer(Extension(PeerUser(user))));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory registry that counts lookups
#[derive(Default)]
pub struct CountingRegistry {
    inner: InMemoryRegistry,
    cluster_lookups: AtomicUsize,
    binding_lookups: AtomicUsize,
}

impl CountingRegistry {
    pub fn new(inner: InMemoryRegistry) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ..Self::default()
        })
    }

    pub fn cluster_lookups(&self) -> usize {
        self.cluster_lookups.load(Ordering::SeqCst)
    }

    pub fn binding_lookups(&self) -> usize {
        self.binding_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterDirectory for CountingRegistry {
    async fn resolve(&self, name: &str) -> Result<Cluster, DirectoryError> {
        self.cluster_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(name).await
    }
}

#[async_trait]
impl BindingResolver for CountingRegistry {
    async fn resolve_binding(
        &self,
        cluster: &str,
        user: &str,
    ) -> Result<ClusterBinding, BindingError> {
        self.binding_lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve_binding(cluster, user).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// Header the test gateway trusts for the caller's user name
pub const USER_HEADER: &str = "x-remote-user";

/// Gateway configuration trusting [`USER_HEADER`]
pub fn gateway_config() -> Config {
    let mut config = Config::default();
    config.auth.trusted_header = Some(USER_HEADER.to_string());
    config
}

/// Run a gateway over `registry` on an ephemeral port
pub async fn spawn_gateway(config: Config, registry: Arc<CountingRegistry>) -> SocketAddr {
    let gateway = Gateway::with_registry(config, Arc::clone(&registry) as _, registry).unwrap();
    let app = gateway
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// `/health` transport statistics of the gateway at `addr`
pub async fn transport_builds(addr: SocketAddr) -> u64 {
    let body = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    health["transports"]["builds"].as_u64().unwrap()
}
