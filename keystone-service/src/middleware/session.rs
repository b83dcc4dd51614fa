//! Session middlewares for the two public surfaces
//!
//! Both extract a bearer token, delegate to the session manager, and inject
//! a [`SessionContext`] into the request extensions. The browser variant
//! additionally enforces CSRF on non-safe methods; the service variant
//! charges the per-tenant rate bucket once the tenant is known.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use super::{IpAllowlist, RateLimit};
use crate::error::{Error, Result};
use crate::session::csrf::CSRF_HEADER;
use crate::session::SessionManager;
use crate::tls::RemoteAddr;

/// Authenticated request identity, injected by the session middlewares.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub tenant_id: String,
    pub user_id: String,
    pub realm_id: String,
    pub jti: String,
}

/// Shared state for the `/service/**` chain.
#[derive(Clone)]
pub struct ServiceChainState {
    pub manager: Arc<SessionManager>,
    pub limiter: Arc<RateLimit>,
    pub allowlist: Arc<IpAllowlist>,
}

/// Extract a bearer token from the Authorization header.
fn extract_bearer(headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Unauthorized("missing Authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or_else(|| Error::Unauthorized("Authorization header is not bearer form".to_string()))
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// `/browser/**` session middleware: CSRF header presence first (non-safe
/// methods), then session validation, then CSRF binding against the
/// session's jti.
pub async fn browser_session_middleware(
    State(manager): State<Arc<SessionManager>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let csrf_header = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !is_safe_method(request.method()) && csrf_header.is_none() {
        return Err(Error::Forbidden("missing CSRF token".to_string()));
    }

    let token = extract_bearer(request.headers())?;
    let claims = manager.validate_session(&token).await?;

    if !is_safe_method(request.method()) {
        let presented = csrf_header.unwrap_or_default();
        if !manager.csrf().verify(&claims.jti, &presented) {
            return Err(Error::Forbidden("invalid CSRF token".to_string()));
        }
    }

    request.extensions_mut().insert(SessionContext {
        tenant_id: claims.tenant_id.clone(),
        user_id: claims.sub.clone(),
        realm_id: claims.realm_id.clone(),
        jti: claims.jti,
    });
    Ok(next.run(request).await)
}

/// `/service/**` session middleware: IP allow-list, per-address bucket,
/// session validation, then the per-tenant bucket.
pub async fn service_session_middleware(
    State(state): State<ServiceChainState>,
    ConnectInfo(RemoteAddr(remote)): ConnectInfo<RemoteAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    state.allowlist.check(remote.ip())?;
    state.limiter.check_addr(remote.ip())?;

    let token = extract_bearer(request.headers())?;
    let claims = state.manager.validate_session(&token).await?;

    state.limiter.check_tenant(&claims.tenant_id)?;

    request.extensions_mut().insert(SessionContext {
        tenant_id: claims.tenant_id.clone(),
        user_id: claims.sub.clone(),
        realm_id: claims.realm_id.clone(),
        jti: claims.jti,
    });
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn missing_and_non_bearer_headers_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            extract_bearer(&headers),
            Err(Error::Unauthorized(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, "Basic xyz".parse().unwrap());
        assert!(matches!(
            extract_bearer(&headers),
            Err(Error::Unauthorized(_))
        ));
    }

    #[test]
    fn safe_methods() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::DELETE));
    }
}
