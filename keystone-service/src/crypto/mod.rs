//! Cryptographic primitives
//!
//! Everything JOSE-shaped in the suite goes through this module: the
//! algorithm registry, key generation and JWK construction, compact JWS and
//! JWE, key derivation (PBKDF2/HKDF), password hashing with a deployment
//! pepper, and TLS certificate issuance.
//!
//! The registry is the single source of truth. Key generation, JWK
//! construction, and the JOSE operations all consult it; an algorithm name
//! that is not in the table is rejected with
//! [`CryptoError::UnsupportedAlgorithm`](crate::error::CryptoError), never
//! silently defaulted.

pub mod certs;
pub mod jwe;
pub mod jwk;
pub mod jws;
pub mod kdf;
pub mod registry;

pub use jwk::{Jwk, KeyMaterial, KeyUse};
pub use registry::{AlgorithmEntry, AlgorithmKind, KeyParams};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory kid-keyed cache over decoded JWKs.
///
/// Lookup misses fall through to the caller's loader; rotation invalidates
/// explicitly. Shared between the session manager and the JOSE handlers.
#[derive(Default)]
pub struct KidCache {
    entries: RwLock<HashMap<String, Arc<Jwk>>>,
}

impl KidCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a JWK by kid
    pub async fn get(&self, kid: &str) -> Option<Arc<Jwk>> {
        self.entries.read().await.get(kid).cloned()
    }

    /// Insert a JWK under its kid
    pub async fn insert(&self, jwk: Jwk) -> Arc<Jwk> {
        let kid = jwk.kid.clone();
        let arc = Arc::new(jwk);
        self.entries.write().await.insert(kid, arc.clone());
        arc
    }

    /// Drop a single kid (rotation hook)
    pub async fn invalidate(&self, kid: &str) {
        self.entries.write().await.remove(kid);
    }

    /// Drop everything
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kid_cache_insert_get_invalidate() {
        let cache = KidCache::new();
        let entry = registry::lookup("HS256").unwrap();
        let material = KeyMaterial::generate(entry).unwrap();
        let jwk = material.to_jwk(entry, KeyUse::Signature).unwrap();
        let kid = jwk.kid.clone();

        cache.insert(jwk).await;
        assert!(cache.get(&kid).await.is_some());

        cache.invalidate(&kid).await;
        assert!(cache.get(&kid).await.is_none());
    }
}
