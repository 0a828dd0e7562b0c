//! Authentication middleware for the Kubernetes gateway
//!
//! Supports:
//! - API keys (`Authorization: Bearer <key>`), each bound to one user
//! - A trusted identity header set by a fronting authenticating proxy
//! - Rate limiting per user
//! - Public paths that bypass authentication
//!
//! The authenticated caller is attached to the request as a [`UserIdentity`]
//! extension; handlers receive it explicitly.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::Result;
use crate::config::AuthConfig;
use crate::error::MESSAGE_HEADER;

/// Type alias for our rate limiter
type UserRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Verified caller identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    name: String,
}

impl UserIdentity {
    /// Identity for `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// User name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolved API key with expanded value
#[derive(Debug, Clone)]
pub struct ResolvedApiKey {
    /// The actual key value
    pub key: String,
    /// User the key authenticates as
    pub user: String,
    /// Rate limit (requests per minute)
    pub rate_limit: u32,
}

/// Resolved authentication configuration (keys expanded)
#[derive(Debug)]
pub struct ResolvedAuthConfig {
    /// Whether auth is enabled
    pub enabled: bool,
    /// Resolved API keys
    pub api_keys: Vec<ResolvedApiKey>,
    /// Header trusted to carry the user name
    pub trusted_header: Option<HeaderName>,
    /// Identity used when auth is disabled
    pub anonymous_user: String,
    /// Public paths
    pub public_paths: Vec<String>,
    /// Rate limiters per user
    rate_limiters: DashMap<String, Arc<UserRateLimiter>>,
}

impl ResolvedAuthConfig {
    /// Create resolved config from `AuthConfig`
    ///
    /// Keys are only resolved when authentication is enabled.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an API key cannot be resolved.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let api_keys = if config.enabled {
            config
                .api_keys
                .iter()
                .map(|k| {
                    Ok(ResolvedApiKey {
                        key: k.resolve_key()?,
                        user: k.user.clone(),
                        rate_limit: k.rate_limit,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        // Pre-create rate limiters for users with rate limits
        let rate_limiters = DashMap::new();
        for key in &api_keys {
            if let Some(quota) = NonZeroU32::new(key.rate_limit) {
                let limiter = RateLimiter::direct(Quota::per_minute(quota));
                rate_limiters.insert(key.user.clone(), Arc::new(limiter));
            }
        }

        Ok(Self {
            enabled: config.enabled,
            api_keys,
            trusted_header: config
                .trusted_header
                .as_deref()
                .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok()),
            anonymous_user: config.anonymous_user.clone(),
            public_paths: config.public_paths.clone(),
            rate_limiters,
        })
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p))
    }

    /// Validate an API key and return the user it belongs to
    #[must_use]
    pub fn validate_token(&self, token: &str) -> Option<UserIdentity> {
        self.api_keys
            .iter()
            .find(|k| bool::from(k.key.as_bytes().ct_eq(token.as_bytes())))
            .map(|k| UserIdentity::new(&k.user))
    }

    /// Check rate limit for a user. Returns true if allowed, false if rate limited.
    #[must_use]
    pub fn check_rate_limit(&self, user: &str) -> bool {
        self.rate_limiters
            .get(user)
            .is_none_or(|limiter| limiter.check().is_ok())
    }

    /// Identity asserted by the trusted header, if configured and present
    fn trusted_identity(&self, request: &Request<Body>) -> Option<UserIdentity> {
        let header = self.trusted_header.as_ref()?;
        let value = request.headers().get(header)?.to_str().ok()?.trim();
        (!value.is_empty()).then(|| UserIdentity::new(value))
    }
}

/// Authentication middleware
pub async fn auth_middleware(
    State(auth_config): State<Arc<ResolvedAuthConfig>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if !auth_config.enabled {
        request
            .extensions_mut()
            .insert(UserIdentity::new(&auth_config.anonymous_user));
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();

    if auth_config.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });

    let identity = match token {
        Some(token) => {
            let Some(identity) = auth_config.validate_token(token) else {
                warn!(path = %path, "Invalid token");
                return unauthorized_response("invalid token");
            };
            identity
        }
        None => match auth_config.trusted_identity(&request) {
            Some(identity) => identity,
            None => {
                warn!(path = %path, "Missing credentials");
                return unauthorized_response(
                    "missing credentials; use Authorization: Bearer <token>",
                );
            }
        },
    };

    if !auth_config.check_rate_limit(identity.name()) {
        warn!(user = %identity, path = %path, "Rate limit exceeded");
        return rate_limited_response(identity.name());
    }

    debug!(user = %identity, path = %path, "Authenticated request");
    request.extensions_mut().insert(identity);
    next.run(request).await
}

/// Create a 401 Unauthorized response
fn unauthorized_response(message: &'static str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [
            (header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer")),
            (MESSAGE_HEADER, HeaderValue::from_static(message)),
        ],
    )
        .into_response()
}

/// Create a 429 Rate Limited response
fn rate_limited_response(user: &str) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, HeaderValue::from_static("60"))],
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("rate limit exceeded for user {user}")) {
        response.headers_mut().insert(MESSAGE_HEADER, value);
    }
    response
}
