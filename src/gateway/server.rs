//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use rustls::crypto::aws_lc_rs;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::auth::ResolvedAuthConfig;
use super::dispatcher::Dispatcher;
use super::rewrite::RequestRewrites;
use super::router::{AppState, create_router};
use crate::config::{Config, RegistryConfig, ServerTlsConfig};
use crate::registry::{BindingResolver, ClusterDirectory, FileRegistry, InMemoryRegistry};
use crate::transport::{ServerVerification, TransportCache, TransportProvider, material};
use crate::{Error, Result};

/// Kubernetes gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared handler state
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a gateway using the registry described by the configuration
    pub async fn new(config: Config) -> Result<Self> {
        let (directory, bindings) = registry_from_config(&config.registry).await?;
        Self::with_registry(config, directory, bindings)
    }

    /// Create a gateway backed by the given directory and resolver
    pub fn with_registry(
        config: Config,
        directory: Arc<dyn ClusterDirectory>,
        bindings: Arc<dyn BindingResolver>,
    ) -> Result<Self> {
        let cache = config.transport_cache.enabled.then(|| {
            Arc::new(TransportCache::new(
                config.transport_cache.ttl,
                config.transport_cache.max_entries,
            ))
        });
        let transports = Arc::new(TransportProvider::new(
            config.upstream.transport_options(),
            cache,
        ));
        let rewrites = RequestRewrites::from_config(&config.rewrites, &config.auth)?;
        let dispatcher = Arc::new(Dispatcher::new(directory, bindings, transports, rewrites));
        let auth_config = Arc::new(ResolvedAuthConfig::from_config(&config.auth)?);

        Ok(Self {
            config,
            state: Arc::new(AppState {
                dispatcher,
                auth_config,
            }),
        })
    }

    /// The HTTP router, without a listener
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state))
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        self.spawn_cache_eviction(&shutdown_tx);
        self.log_banner(addr);

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown_timeout = self.config.server.shutdown_timeout;

        match &self.config.server.tls {
            None => {
                let listener = TcpListener::bind(addr).await?;
                let mut deadline_rx = shutdown_tx.subscribe();
                let server = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
                    .into_future();

                // Long-lived watches would otherwise hold shutdown open forever
                tokio::select! {
                    result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
                    () = async move {
                        let _ = deadline_rx.recv().await;
                        tokio::time::sleep(shutdown_timeout).await;
                    } => warn!(timeout = ?shutdown_timeout, "Graceful shutdown timed out"),
                }
            }
            Some(tls) => {
                let tls_config = RustlsConfig::from_config(Arc::new(server_tls_config(tls).await?));
                let handle = axum_server::Handle::new();

                let shutdown_handle = handle.clone();
                let signal_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    shutdown_signal(signal_tx).await;
                    shutdown_handle.graceful_shutdown(Some(shutdown_timeout));
                });

                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
        }

        info!("Gateway stopped");
        Ok(())
    }

    /// Sweep expired transports until shutdown
    fn spawn_cache_eviction(&self, shutdown_tx: &broadcast::Sender<()>) {
        let Some(cache) = self.state.dispatcher.transports().cache() else {
            return;
        };
        let cache = Arc::clone(cache);
        let period = self.config.transport_cache.eviction_interval;
        let mut shutdown_rx = shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cache.evict_expired();
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Transport eviction stopped");
                        break;
                    }
                }
            }
        });
    }

    fn log_banner(&self, addr: SocketAddr) {
        let scheme = if self.config.server.tls.is_some() { "https" } else { "http" };

        info!("============================================================");
        info!("KUBE GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(%addr, scheme, "Listening");
        info!("  {scheme}://{addr}/proxy/{{cluster}}/k8s/{{path}}");

        match &self.config.registry.file {
            Some(path) => info!(path = %path, "Registry file (re-read per request)"),
            None => info!(
                clusters = self.config.registry.clusters.len(),
                bindings = self.config.registry.bindings.len(),
                "Inline registry"
            ),
        }

        if self.config.auth.enabled {
            info!(
                api_keys = self.config.auth.api_keys.len(),
                trusted_header = self.config.auth.trusted_header.as_deref().unwrap_or("-"),
                "AUTHENTICATION enabled"
            );
        } else {
            warn!(
                user = %self.config.auth.anonymous_user,
                "AUTHENTICATION disabled - every caller acts as the anonymous user"
            );
        }

        if self.config.upstream.server_verification == ServerVerification::Insecure {
            warn!("UPSTREAM VERIFICATION disabled - API server certificates are not checked");
        }

        if self.config.transport_cache.enabled {
            info!(
                ttl = ?self.config.transport_cache.ttl,
                max_entries = self.config.transport_cache.max_entries,
                "Transport cache enabled"
            );
        } else {
            info!("Transport cache disabled - one transport per request");
        }
        info!("============================================================");
    }
}

/// Build the directory and resolver the configuration asks for
async fn registry_from_config(
    config: &RegistryConfig,
) -> Result<(Arc<dyn ClusterDirectory>, Arc<dyn BindingResolver>)> {
    if let Some(path) = &config.file {
        let registry = Arc::new(FileRegistry::new(path));
        // Fail fast on a missing or malformed file; later edits are picked up live
        let doc = registry.load().await.map_err(Error::Config)?;
        info!(
            clusters = doc.clusters.len(),
            bindings = doc.bindings.len(),
            "Registry file loaded"
        );
        let directory: Arc<dyn ClusterDirectory> = Arc::clone(&registry) as _;
        let bindings: Arc<dyn BindingResolver> = registry;
        return Ok((directory, bindings));
    }

    let registry = Arc::new(InMemoryRegistry::from_document(&config.inline_document()).await?);
    let directory: Arc<dyn ClusterDirectory> = Arc::clone(&registry) as _;
    let bindings: Arc<dyn BindingResolver> = registry;
    Ok((directory, bindings))
}

/// Listener TLS config from PEM files
async fn server_tls_config(tls: &ServerTlsConfig) -> Result<ServerConfig> {
    let cert_pem = tokio::fs::read(&tls.cert)
        .await
        .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", tls.cert)))?;
    let key_pem = tokio::fs::read(&tls.key)
        .await
        .map_err(|e| Error::Config(format!("Cannot read '{}': {e}", tls.key)))?;

    let certs = material::parse_certificates(&cert_pem, "server certificate")
        .map_err(|e| Error::Config(e.to_string()))?;
    let key = material::parse_private_key(&key_pem).map_err(|e| Error::Config(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS config error: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    // Prefer HTTP/2, fall back to HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
