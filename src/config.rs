//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use axum::http::{HeaderName, HeaderValue, Method};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::registry::{BindingRecord, ClusterRecord, RegistryDocument};
use crate::transport::{ServerVerification, TransportOptions};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Caller authentication
    pub auth: AuthConfig,
    /// Upstream API server connections
    pub upstream: UpstreamConfig,
    /// Per-user transport caching
    pub transport_cache: TransportCacheConfig,
    /// Outgoing request rewrites
    pub rewrites: RewritesConfig,
    /// Cluster and binding records
    pub registry: RegistryConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // KUBE_GATEWAY_SERVER__PORT=8443 → server.port
        figment = figment.merge(Env::prefixed("KUBE_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::Config(format!(
                "server.host '{}' is not an IP address",
                self.server.host
            )));
        }

        if let Some(tls) = &self.server.tls {
            if tls.cert.is_empty() || tls.key.is_empty() {
                return Err(Error::Config(
                    "server.tls requires both cert and key".to_string(),
                ));
            }
        }

        if self.auth.enabled && self.auth.api_keys.is_empty() && self.auth.trusted_header.is_none()
        {
            return Err(Error::Config(
                "auth is enabled but neither api_keys nor trusted_header is configured"
                    .to_string(),
            ));
        }
        for key in &self.auth.api_keys {
            if key.user.is_empty() {
                return Err(Error::Config("auth.api_keys entry without user".to_string()));
            }
            if self.auth.enabled {
                key.resolve_key()?;
            }
        }
        if let Some(header) = &self.auth.trusted_header {
            HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                Error::Config(format!("auth.trusted_header '{header}': {e}"))
            })?;
        }

        if self.transport_cache.enabled {
            if self.transport_cache.ttl.is_zero() {
                return Err(Error::Config("transport_cache.ttl must be positive".to_string()));
            }
            if self.transport_cache.eviction_interval.is_zero() {
                return Err(Error::Config(
                    "transport_cache.eviction_interval must be positive".to_string(),
                ));
            }
            if self.transport_cache.max_entries == 0 {
                return Err(Error::Config(
                    "transport_cache.max_entries must be positive".to_string(),
                ));
            }
        }

        for rule in &self.rewrites.header_overrides {
            rule.parse()?;
        }

        if self.registry.file.is_some()
            && (!self.registry.clusters.is_empty() || !self.registry.bindings.is_empty())
        {
            return Err(Error::Config(
                "registry: set either file or inline clusters/bindings, not both".to_string(),
            ));
        }

        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR}, ${VAR:-default} and ~ in file paths
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };
        let expand = |value: &mut String| *value = expand_home(&Self::expand_string(&re, value));
        let expand_opt = |value: &mut Option<String>| {
            if let Some(v) = value.as_mut() {
                *v = expand_home(&Self::expand_string(&re, v));
            }
        };

        if let Some(tls) = self.server.tls.as_mut() {
            expand(&mut tls.cert);
            expand(&mut tls.key);
        }

        expand_opt(&mut self.registry.file);
        for cluster in self.registry.clusters.values_mut() {
            cluster.api_server = Self::expand_string(&re, &cluster.api_server);
            expand_opt(&mut cluster.private_key_file);
            expand_opt(&mut cluster.ca_cert_file);
        }
        for binding in &mut self.registry.bindings {
            expand_opt(&mut binding.certificate_file);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Serve HTTPS instead of plain HTTP
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            shutdown_timeout: Duration::from_secs(30),
            tls: None,
        }
    }
}

/// Listener certificate for HTTPS
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    /// PEM certificate chain path
    pub cert: String,
    /// PEM private key path
    pub key: String,
}

/// Authentication configuration for gateway access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Enable authentication. When disabled every caller is `anonymous_user`.
    pub enabled: bool,

    /// API keys, each bound to one user
    pub api_keys: Vec<ApiKeyConfig>,

    /// Header carrying a user name asserted by a fronting proxy
    /// (e.g. `X-Remote-User`). Only enable behind a proxy that sets it.
    pub trusted_header: Option<String>,

    /// User name assigned when authentication is disabled
    pub anonymous_user: String,

    /// Paths that bypass authentication (default: `["/health"]`)
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_keys: Vec::new(),
            trusted_header: None,
            anonymous_user: "anonymous".to_string(),
            public_paths: default_public_paths(),
        }
    }
}

/// API key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// The API key value (supports `env:VAR_NAME`)
    pub key: String,

    /// User this key authenticates as
    pub user: String,

    /// Rate limit (requests per minute, 0 = unlimited)
    #[serde(default)]
    pub rate_limit: u32,
}

impl ApiKeyConfig {
    /// Resolve the API key (expand env vars)
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the key is empty or names an environment
    /// variable that is unset or empty.
    pub fn resolve_key(&self) -> Result<String> {
        let key = match self.key.strip_prefix("env:") {
            Some(var_name) => env::var(var_name).map_err(|e| {
                Error::Config(format!(
                    "auth.api_keys entry for user '{}': {var_name}: {e}",
                    self.user
                ))
            })?,
            None => self.key.clone(),
        };
        if key.is_empty() {
            return Err(Error::Config(format!(
                "auth.api_keys entry for user '{}' has an empty key",
                self.user
            )));
        }
        Ok(key)
    }
}

/// Upstream connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API server certificate checking: `cluster-ca` or `insecure`
    pub server_verification: ServerVerification,
    /// Connect timeout (`0s` disables)
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// TCP keepalive (`0s` disables)
    #[serde(with = "humantime_serde")]
    pub tcp_keepalive: Duration,
    /// Idle pooled connection lifetime (`0s` disables)
    #[serde(with = "humantime_serde")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            server_verification: ServerVerification::default(),
            connect_timeout: Duration::from_secs(10),
            tcp_keepalive: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl UpstreamConfig {
    /// Options for the transport builder
    #[must_use]
    pub fn transport_options(&self) -> TransportOptions {
        let non_zero = |d: Duration| (!d.is_zero()).then_some(d);
        TransportOptions {
            server_verification: self.server_verification,
            connect_timeout: non_zero(self.connect_timeout),
            tcp_keepalive: non_zero(self.tcp_keepalive),
            pool_idle_timeout: non_zero(self.pool_idle_timeout),
        }
    }
}

/// Transport cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportCacheConfig {
    /// Reuse transports across requests (disable to build one per request)
    pub enabled: bool,
    /// Entry lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// How often expired entries are swept
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Duration,
    /// Upper bound on cached transports
    pub max_entries: usize,
}

impl Default for TransportCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            eviction_interval: Duration::from_secs(60),
            max_entries: 1024,
        }
    }
}

/// Outgoing request rewrites
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RewritesConfig {
    /// Extra per-method header overrides, applied after the built-in
    /// `PATCH → Content-Type: application/merge-patch+json` rule
    pub header_overrides: Vec<HeaderOverrideConfig>,
}

/// One `(method, header, value)` override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderOverrideConfig {
    /// HTTP method the rule applies to
    pub method: String,
    /// Header to set
    pub header: String,
    /// Value to set
    pub value: String,
}

impl HeaderOverrideConfig {
    /// Parse into typed HTTP values.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any part is invalid.
    pub fn parse(&self) -> Result<(Method, HeaderName, HeaderValue)> {
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| Error::Config(format!("header override method '{}': {e}", self.method)))?;
        let header = HeaderName::from_bytes(self.header.as_bytes())
            .map_err(|e| Error::Config(format!("header override name '{}': {e}", self.header)))?;
        let value = HeaderValue::from_str(&self.value)
            .map_err(|e| Error::Config(format!("header override value '{}': {e}", self.value)))?;
        Ok((method, header, value))
    }
}

/// Where cluster and binding records come from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// YAML registry file, re-read on every lookup
    pub file: Option<String>,
    /// Inline clusters keyed by name
    pub clusters: HashMap<String, ClusterRecord>,
    /// Inline bindings
    pub bindings: Vec<BindingRecord>,
}

impl RegistryConfig {
    /// Inline records as a registry document
    #[must_use]
    pub fn inline_document(&self) -> RegistryDocument {
        RegistryDocument {
            clusters: self.clusters.clone(),
            bindings: self.bindings.clone(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms", "1h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        // "ms" before "s" and "m"
        let (digits, scale) = if let Some(ms) = s.strip_suffix("ms") {
            return number(ms).map(Duration::from_millis);
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            // Assume seconds
            (s, 1)
        };
        number(digits)?
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is out of range"))
    }

    fn number(digits: &str) -> Result<u64, String> {
        digits
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{digits}': {e}"))
    }
}
