//! JOSE key issuance service
//!
//! A thin composition over the keystone service template: tenants mint
//! signing and encryption keys, fetch their public JWKs, and sign payloads
//! with keys they own. Private key material never leaves the barrier
//! unwrapped.

pub mod handlers;
pub mod store;

use keystone_service::prelude::*;

/// Domain schema set (versions ≥ 2001).
pub fn domain_migrations() -> Vec<Migration> {
    vec![Migration::new(
        2001,
        "jose_keys",
        include_str!("../migrations/2001_jose_keys.up.sql"),
    )]
}

/// Route registration for the two public surfaces.
pub fn register_routes(mut routes: PublicRoutes) -> PublicRoutes {
    routes.service = routes
        .service
        .route("/keys", post(handlers::create_key))
        .route("/keys/{kid}", get(handlers::get_key))
        .route("/keys/{kid}/sign", post(handlers::sign_payload));
    routes.browser = routes.browser.route("/keys", get(handlers::list_keys));
    routes
}
