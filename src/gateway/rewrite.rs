//! Header and status rewriting between caller and API server

use std::net::IpAddr;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

use crate::config::{AuthConfig, RewritesConfig};
use crate::Result;

/// Headers meaningful only for a single transport-level connection.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Target of a proxied request, taken from `/proxy/{cluster}/k8s/{path}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Cluster name
    pub cluster: String,
    /// Path to forward, still percent-encoded, always starting with `/`
    pub forward_path: String,
    /// Raw query string
    pub query: Option<String>,
}

impl ProxyTarget {
    /// Split the gateway prefix off `uri`.
    ///
    /// The forward path is cut from the raw path so percent-encoding and
    /// trailing slashes reach the API server untouched.
    #[must_use]
    pub fn from_uri(cluster: impl Into<String>, uri: &Uri) -> Self {
        // "", "proxy", "{cluster}", "k8s", rest
        let rest = uri.path().splitn(5, '/').nth(4).unwrap_or_default();
        Self {
            cluster: cluster.into(),
            forward_path: format!("/{rest}"),
            query: uri.query().map(str::to_owned),
        }
    }
}

/// One `(method, header, value)` override
#[derive(Debug, Clone)]
struct HeaderOverride {
    method: Method,
    header: HeaderName,
    value: HeaderValue,
}

/// Outgoing request rewrite rules
#[derive(Debug, Clone)]
pub struct RequestRewrites {
    overrides: Vec<HeaderOverride>,
    strip: Vec<HeaderName>,
}

impl Default for RequestRewrites {
    fn default() -> Self {
        Self {
            overrides: vec![HeaderOverride {
                method: Method::PATCH,
                header: header::CONTENT_TYPE,
                value: HeaderValue::from_static("application/merge-patch+json"),
            }],
            strip: vec![header::AUTHORIZATION],
        }
    }
}

impl RequestRewrites {
    /// Built-in rules plus configured overrides; strips the trusted
    /// identity header when one is configured.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparseable override.
    pub fn from_config(rewrites: &RewritesConfig, auth: &AuthConfig) -> Result<Self> {
        let mut this = Self::default();
        for rule in &rewrites.header_overrides {
            let (method, header, value) = rule.parse()?;
            this = this.with_override(method, header, value);
        }
        if let Some(name) = auth
            .trusted_header
            .as_deref()
            .and_then(|h| HeaderName::from_bytes(h.as_bytes()).ok())
        {
            this = this.strip_header(name);
        }
        Ok(this)
    }

    /// Add a rule, replacing any existing rule for the same method and header
    #[must_use]
    pub fn with_override(mut self, method: Method, header: HeaderName, value: HeaderValue) -> Self {
        self.overrides
            .retain(|o| !(o.method == method && o.header == header));
        self.overrides.push(HeaderOverride {
            method,
            header,
            value,
        });
        self
    }

    /// Never forward `name` upstream
    #[must_use]
    pub fn strip_header(mut self, name: HeaderName) -> Self {
        if !self.strip.contains(&name) {
            self.strip.push(name);
        }
        self
    }

    /// Headers to send upstream for a `method` request carrying `incoming`.
    ///
    /// Drops hop-by-hop headers, `Host`, the gateway's credential headers and
    /// `Impersonate-*`; appends the caller to `X-Forwarded-For`; re-adds the
    /// upgrade handshake for `upgrade` requests; then applies the method rules.
    #[must_use]
    pub fn outgoing_headers(
        &self,
        method: &Method,
        incoming: &HeaderMap,
        peer: Option<IpAddr>,
        upgrade: Option<&HeaderValue>,
    ) -> HeaderMap {
        let mut headers = strip_hop_by_hop(incoming);
        headers.remove(header::HOST);
        for name in &self.strip {
            headers.remove(name);
        }
        let impersonation: Vec<HeaderName> = headers
            .keys()
            .filter(|name| name.as_str().starts_with("impersonate-"))
            .cloned()
            .collect();
        for name in impersonation {
            headers.remove(name);
        }

        if incoming
            .get_all(header::TE)
            .iter()
            .any(|v| v.to_str().is_ok_and(|v| has_token(v, "trailers")))
        {
            headers.insert(header::TE, HeaderValue::from_static("trailers"));
        }

        if let Some(protocol) = upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
            headers.insert(header::UPGRADE, protocol.clone());
        }

        if let Some(ip) = peer {
            let prior: Vec<&str> = incoming
                .get_all(&X_FORWARDED_FOR)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect();
            let value = if prior.is_empty() {
                ip.to_string()
            } else {
                format!("{}, {ip}", prior.join(", "))
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        for rule in self.overrides.iter().filter(|o| o.method == method) {
            headers.insert(rule.header.clone(), rule.value.clone());
        }

        headers
    }
}

/// Copy `headers` without hop-by-hop headers, `Upgrade`, or any header named
/// in `Connection`.
#[must_use]
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name)
            || name == header::UPGRADE
            || listed.iter().any(|l| l == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers to relay back for a `101 Switching Protocols` response.
#[must_use]
pub fn upgrade_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(upstream);
    if let Some(protocol) = upstream.get(header::UPGRADE) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, protocol.clone());
    }
    headers
}

/// The protocol a caller asks to switch to, if this is an upgrade request.
#[must_use]
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<&HeaderValue> {
    let wants_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .any(|v| v.to_str().is_ok_and(|v| has_token(v, "upgrade")));
    if wants_upgrade {
        headers.get(header::UPGRADE)
    } else {
        None
    }
}

/// Map an upstream status to the one reported to the caller.
///
/// An upstream 403 becomes 500, keeping 403 reserved for the gateway's own
/// membership decision.
#[must_use]
pub fn filter_status(status: StatusCode) -> StatusCode {
    if status == StatusCode::FORBIDDEN {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        status
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeaderOverrideConfig;
    use pretty_assertions::assert_eq;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn target_strips_gateway_prefix() {
        let uri: Uri = "/proxy/demo-cluster/k8s/api/v1/namespaces?watch=true"
            .parse()
            .unwrap();
        let target = ProxyTarget::from_uri("demo-cluster", &uri);
        assert_eq!(target.forward_path, "/api/v1/namespaces");
        assert_eq!(target.query.as_deref(), Some("watch=true"));
    }

    #[test]
    fn target_defaults_to_root() {
        for raw in ["/proxy/demo/k8s", "/proxy/demo/k8s/"] {
            let uri: Uri = raw.parse().unwrap();
            assert_eq!(ProxyTarget::from_uri("demo", &uri).forward_path, "/");
        }
    }

    #[test]
    fn target_keeps_encoding_and_trailing_slash() {
        let uri: Uri = "/proxy/demo/k8s/api/v1/namespaces/a%2Fb/".parse().unwrap();
        assert_eq!(
            ProxyTarget::from_uri("demo", &uri).forward_path,
            "/api/v1/namespaces/a%2Fb/"
        );
    }

    #[test]
    fn patch_forces_merge_patch_content_type() {
        let rewrites = RequestRewrites::default();
        let incoming = headers(&[("content-type", "application/json-patch+json")]);
        let out = rewrites.outgoing_headers(&Method::PATCH, &incoming, None, None);
        assert_eq!(out[header::CONTENT_TYPE], "application/merge-patch+json");

        let out = rewrites.outgoing_headers(&Method::PATCH, &HeaderMap::new(), None, None);
        assert_eq!(out[header::CONTENT_TYPE], "application/merge-patch+json");

        let out = rewrites.outgoing_headers(&Method::PUT, &incoming, None, None);
        assert_eq!(out[header::CONTENT_TYPE], "application/json-patch+json");
    }

    #[test]
    fn configured_override_replaces_builtin() {
        let config = RewritesConfig {
            header_overrides: vec![HeaderOverrideConfig {
                method: "patch".to_string(),
                header: "Content-Type".to_string(),
                value: "application/strategic-merge-patch+json".to_string(),
            }],
        };
        let rewrites = RequestRewrites::from_config(&config, &AuthConfig::default()).unwrap();
        let out = rewrites.outgoing_headers(&Method::PATCH, &HeaderMap::new(), None, None);
        assert_eq!(out.get_all(header::CONTENT_TYPE).iter().count(), 1);
        assert_eq!(out[header::CONTENT_TYPE], "application/strategic-merge-patch+json");
    }

    #[test]
    fn strips_hop_by_hop_and_connection_listed_headers() {
        let incoming = headers(&[
            ("connection", "keep-alive, x-trace-hop"),
            ("keep-alive", "timeout=5"),
            ("transfer-encoding", "chunked"),
            ("proxy-authorization", "Basic Zm9v"),
            ("x-trace-hop", "1"),
            ("host", "gateway.local"),
            ("accept", "application/json"),
        ]);
        let out = RequestRewrites::default().outgoing_headers(&Method::GET, &incoming, None, None);
        let names: Vec<&str> = out.keys().map(HeaderName::as_str).collect();
        assert_eq!(names, vec!["accept"]);
    }

    #[test]
    fn strips_credentials_and_impersonation() {
        let incoming = headers(&[
            ("authorization", "Bearer gateway-key"),
            ("x-remote-user", "alice"),
            ("impersonate-user", "system:admin"),
            ("impersonate-group", "system:masters"),
            ("impersonate-extra-scopes", "all"),
            ("user-agent", "kubectl/v1.31"),
        ]);
        let auth = AuthConfig {
            trusted_header: Some("X-Remote-User".to_string()),
            ..AuthConfig::default()
        };
        let rewrites = RequestRewrites::from_config(&RewritesConfig::default(), &auth).unwrap();
        let out = rewrites.outgoing_headers(&Method::GET, &incoming, None, None);
        let names: Vec<&str> = out.keys().map(HeaderName::as_str).collect();
        assert_eq!(names, vec!["user-agent"]);
    }

    #[test]
    fn keeps_te_trailers_only() {
        let incoming = headers(&[("te", "gzip, trailers")]);
        let out = RequestRewrites::default().outgoing_headers(&Method::GET, &incoming, None, None);
        assert_eq!(out[header::TE], "trailers");

        let incoming = headers(&[("te", "gzip")]);
        let out = RequestRewrites::default().outgoing_headers(&Method::GET, &incoming, None, None);
        assert!(out.get(header::TE).is_none());
    }

    #[test]
    fn appends_forwarded_for() {
        let peer: IpAddr = "192.0.2.7".parse().unwrap();
        let out = RequestRewrites::default().outgoing_headers(
            &Method::GET,
            &HeaderMap::new(),
            Some(peer),
            None,
        );
        assert_eq!(out[X_FORWARDED_FOR], "192.0.2.7");

        let incoming = headers(&[("x-forwarded-for", "203.0.113.1")]);
        let out =
            RequestRewrites::default().outgoing_headers(&Method::GET, &incoming, Some(peer), None);
        assert_eq!(out[X_FORWARDED_FOR], "203.0.113.1, 192.0.2.7");
    }

    #[test]
    fn upgrade_requests_keep_handshake() {
        let incoming = headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "SPDY/3.1"),
            ("x-stream-protocol-version", "v4.channel.k8s.io"),
        ]);
        let protocol = upgrade_protocol(&incoming).cloned();
        assert_eq!(protocol.as_ref().unwrap(), "SPDY/3.1");

        let out = RequestRewrites::default().outgoing_headers(
            &Method::POST,
            &incoming,
            None,
            protocol.as_ref(),
        );
        assert_eq!(out[header::CONNECTION], "Upgrade");
        assert_eq!(out[header::UPGRADE], "SPDY/3.1");
        assert_eq!(out["x-stream-protocol-version"], "v4.channel.k8s.io");
    }

    #[test]
    fn upgrade_needs_connection_token() {
        assert!(upgrade_protocol(&headers(&[("upgrade", "websocket")])).is_none());
        let incoming = headers(&[("connection", "keep-alive, upgrade"), ("upgrade", "websocket")]);
        assert!(upgrade_protocol(&incoming).is_some());
    }

    #[test]
    fn only_forbidden_is_rewritten() {
        assert_eq!(filter_status(StatusCode::FORBIDDEN), StatusCode::INTERNAL_SERVER_ERROR);
        for status in [
            StatusCode::OK,
            StatusCode::CREATED,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
            StatusCode::CONFLICT,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(filter_status(status), status);
        }
    }

    #[test]
    fn upgrade_response_keeps_protocol_headers() {
        let upstream = headers(&[
            ("connection", "Upgrade"),
            ("upgrade", "SPDY/3.1"),
            ("x-stream-protocol-version", "v4.channel.k8s.io"),
        ]);
        let out = upgrade_response_headers(&upstream);
        assert_eq!(out[header::UPGRADE], "SPDY/3.1");
        assert_eq!(out[header::CONNECTION], "Upgrade");
        assert_eq!(out["x-stream-protocol-version"], "v4.channel.k8s.io");
    }
}
