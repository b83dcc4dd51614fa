//! Middleware chains for the public listener
//!
//! Two disjoint stacks, one per URL surface:
//!
//! - `/browser/**`: CSRF check on non-safe methods, explicit-origin CORS,
//!   CSP headers, browser session validation.
//! - `/service/**`: IP allow-list, token-bucket rate limiting (per remote
//!   address and per tenant), service session validation.
//!
//! A request matching neither prefix never touches either stack and falls
//! through to a 404. The admin listener carries none of this.

mod rate_limit;
mod session;

pub use rate_limit::RateLimit;
pub use session::{
    browser_session_middleware, service_session_middleware, ServiceChainState, SessionContext,
};

use axum::http::{HeaderValue, Method};
use axum::Router;
use ipnet::IpNet;
use std::net::IpAddr;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::{CorsConfig, CspConfig, IpAllowlistConfig};
use crate::error::{Error, PolicyError, Result};

/// Compiled IP allow-list: exact addresses and CIDR prefixes.
///
/// An empty list allows every address (development default).
pub struct IpAllowlist {
    entries: Vec<IpNet>,
}

impl IpAllowlist {
    /// Compile from configuration; a malformed entry is a startup error.
    pub fn from_config(config: &IpAllowlistConfig) -> Result<Self> {
        let mut entries = Vec::with_capacity(config.entries.len());
        for raw in &config.entries {
            let net = if raw.contains('/') {
                raw.parse::<IpNet>().map_err(|e| e.to_string())
            } else {
                raw.parse::<IpAddr>()
                    .map(IpNet::from)
                    .map_err(|e| e.to_string())
            };
            entries.push(net.map_err(|e| {
                Error::Config(format!("ip_allowlist entry '{raw}' is invalid: {e}"))
            })?);
        }
        Ok(Self { entries })
    }

    /// Whether the remote address passes the list.
    pub fn allows(&self, addr: IpAddr) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|net| net.contains(&addr))
    }

    /// Policy check returning the canonical error.
    pub fn check(&self, addr: IpAddr) -> Result<()> {
        if self.allows(addr) {
            Ok(())
        } else {
            Err(Error::Policy(PolicyError::ForbiddenIp(addr.to_string())))
        }
    }
}

/// Apply the browser-surface response headers: explicit-origin CORS and CSP.
pub fn apply_browser_headers<S>(app: Router<S>, cors: &CorsConfig, csp: &CspConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let mut app = app;

    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    let cors_layer = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
        ]))
        .allow_headers(AllowHeaders::list([
            http::header::CONTENT_TYPE,
            http::header::AUTHORIZATION,
            http::HeaderName::from_static(crate::session::csrf::CSRF_HEADER),
        ]));
    app = app.layer(cors_layer);

    if let Ok(value) = HeaderValue::from_str(&csp.header_value()) {
        app = app.layer(SetResponseHeaderLayer::overriding(
            http::header::CONTENT_SECURITY_POLICY,
            value,
        ));
    }
    if csp.nosniff {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ));
    }

    app
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_allows_everything() {
        let list = IpAllowlist::from_config(&IpAllowlistConfig::default()).unwrap();
        assert!(list.allows("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn exact_and_cidr_entries_match() {
        let list = IpAllowlist::from_config(&IpAllowlistConfig {
            entries: vec!["127.0.0.1".to_string(), "10.0.0.0/8".to_string()],
        })
        .unwrap();
        assert!(list.allows("127.0.0.1".parse().unwrap()));
        assert!(list.allows("10.20.30.40".parse().unwrap()));
        assert!(!list.allows("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn check_returns_forbidden_ip() {
        let list = IpAllowlist::from_config(&IpAllowlistConfig {
            entries: vec!["10.0.0.0/8".to_string()],
        })
        .unwrap();
        assert!(matches!(
            list.check("192.0.2.1".parse().unwrap()),
            Err(Error::Policy(PolicyError::ForbiddenIp(_)))
        ));
    }

    #[test]
    fn malformed_entry_is_a_config_error() {
        let result = IpAllowlist::from_config(&IpAllowlistConfig {
            entries: vec!["not-an-address".to_string()],
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
