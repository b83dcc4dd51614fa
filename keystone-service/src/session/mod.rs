//! Session token issuance and validation
//!
//! Per-realm policy picks the token form: JWS signed with the configured
//! registry algorithm, or JWE encrypted under a tenant symmetric key. Either
//! way the claims are the same (`iss`, `sub`, `aud`, `exp`, `iat`, `jti`,
//! `tenant_id`, `realm_id`) and the token is opaque to the middleware.
//!
//! The signing/encryption JWKs are persisted wrapped by the barrier, exactly
//! one active per `(tenant, use)`. Issuance rotates a stale active key lazily;
//! the cleanup task rotates idle tenants' keys and sweeps rows whose validity
//! window has closed (EXPIRED → PURGED), clearing the kid cache when it does.

pub mod csrf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::barrier::Barrier;
use crate::config::{SessionConfig, SessionForm};
use crate::crypto::jwk::{Jwk, KeyMaterial, KeyUse};
use crate::crypto::{jwe, jws, registry, KidCache};
use crate::error::{Error, Result, SessionError};
use crate::repository::{Repository, SessionJwkRow};
use csrf::CsrfProtect;

/// JWE session tokens always use this content encryption.
const SESSION_ENC: &str = "A256GCM";

/// Claims carried by every session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    pub tenant_id: String,
    pub realm_id: String,
}

/// A freshly issued session.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    /// The bearer token (compact JWS or JWE)
    pub token: String,
    /// CSRF token bound to the session jti
    pub csrf_token: String,
    /// The claims that went into the token
    pub claims: SessionClaims,
}

/// Issues and validates session tokens for every tenant.
pub struct SessionManager {
    repo: Arc<Repository>,
    barrier: Arc<Barrier>,
    config: SessionConfig,
    issuer: String,
    audience: String,
    cache: KidCache,
    csrf: CsrfProtect,
}

impl SessionManager {
    /// Create a session manager.
    pub fn new(
        repo: Arc<Repository>,
        barrier: Arc<Barrier>,
        config: SessionConfig,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            barrier,
            config,
            issuer: issuer.into(),
            audience: audience.into(),
            cache: KidCache::new(),
            csrf: CsrfProtect::new(),
        }
    }

    /// The CSRF protector bound to this manager's process key.
    pub fn csrf(&self) -> &CsrfProtect {
        &self.csrf
    }

    /// Issue a session token.
    ///
    /// `form` and `ttl` are the realm's policy when present, the service
    /// defaults otherwise.
    pub async fn issue_session(
        &self,
        tenant_id: &str,
        user_id: &str,
        realm_id: &str,
        form: Option<SessionForm>,
        ttl: Option<Duration>,
    ) -> Result<IssuedSession> {
        let form = form.unwrap_or(self.config.form);
        let ttl = ttl.unwrap_or_else(|| self.config.ttl());
        let now = Utc::now();

        let claims = SessionClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            aud: self.audience.clone(),
            exp: (now + chrono::Duration::from_std(ttl).unwrap_or_default()).timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            realm_id: realm_id.to_string(),
        };

        let token = match form {
            SessionForm::Jws => {
                let jwk = self.ensure_active_jwk(tenant_id, KeyUse::Signature).await?;
                jws::sign_claims(&jwk, &claims)?
            }
            SessionForm::Jwe => {
                let jwk = self.ensure_active_jwk(tenant_id, KeyUse::Encryption).await?;
                let key = jwk.symmetric_key()?;
                let payload = serde_json::to_vec(&claims)
                    .map_err(|e| Error::Internal(format!("claims encode: {e}")))?;
                jwe::encrypt(SESSION_ENC, &key, &jwk.kid, &payload)?
            }
        };

        let csrf_token = self.csrf.mint(&claims.jti);
        Ok(IssuedSession {
            token,
            csrf_token,
            claims,
        })
    }

    /// Validate a session token and return its claims.
    pub async fn validate_session(&self, token: &str) -> Result<SessionClaims> {
        let now = Utc::now();
        match token.matches('.').count() {
            // header.payload.signature
            2 => {
                let kid =
                    jws::peek_kid(token).map_err(|_| Error::Session(SessionError::Malformed))?;
                let jwk = self.lookup_jwk(&kid, now).await?;
                jws::verify_claims::<SessionClaims>(&jwk, token, &self.audience)
                    .map_err(|e| Error::Session(map_verify_error(e)))
            }
            // header.encrypted_key.iv.ciphertext.tag
            4 => {
                let header = jwe::peek_header(token)
                    .map_err(|_| Error::Session(SessionError::Malformed))?;
                let jwk = self.lookup_jwk(&header.kid, now).await?;
                let key = jwk
                    .symmetric_key()
                    .map_err(|_| Error::Session(SessionError::Malformed))?;
                let payload = jwe::decrypt(&key, token)
                    .map_err(|_| Error::Session(SessionError::Signature))?;
                let claims: SessionClaims = serde_json::from_slice(&payload)
                    .map_err(|_| Error::Session(SessionError::Malformed))?;

                if claims.exp < now.timestamp() {
                    return Err(Error::Session(SessionError::Expired));
                }
                if claims.aud != self.audience {
                    return Err(Error::Session(SessionError::WrongAudience));
                }
                Ok(claims)
            }
            _ => Err(Error::Session(SessionError::Malformed)),
        }
    }

    /// Start the periodic cleanup task: rotate stale active keys, sweep
    /// closed validity windows.
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: &CancellationToken) {
        let manager = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => return,
                }
                if let Err(e) = manager.run_cleanup_once().await {
                    tracing::warn!("session cleanup sweep failed: {e}");
                }
            }
        });
    }

    /// One cleanup sweep (exposed for tests).
    pub async fn run_cleanup_once(&self) -> Result<u64> {
        let now = Utc::now();

        // Rotate active keys past their TTL so issuance never outlives it.
        for row in self.repo.list_active_session_jwks().await? {
            if let Ok(created) = DateTime::parse_from_rfc3339(&row.created_at) {
                let age = now.signed_duration_since(created.with_timezone(&Utc));
                if age.num_seconds() >= self.config.ttl_secs as i64 {
                    let key_use = match row.key_use.as_str() {
                        "enc" => KeyUse::Encryption,
                        _ => KeyUse::Signature,
                    };
                    if let Err(e) = self.rotate_tenant_key(&row.tenant_id, key_use).await {
                        tracing::warn!(
                            tenant_id = %row.tenant_id,
                            "scheduled session key rotation failed: {e}"
                        );
                    }
                }
            }
        }

        let purged = self.repo.purge_expired_session_jwks(now).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired session keys");
            // Purged kids must stop validating immediately.
            self.cache.clear().await;
        }
        Ok(purged)
    }

    /// Fetch a validation JWK by kid: cache, then storage (unwrapping via
    /// the barrier), with the row's lifecycle enforced.
    async fn lookup_jwk(&self, kid: &str, now: DateTime<Utc>) -> Result<Arc<Jwk>> {
        if let Some(jwk) = self.cache.get(kid).await {
            return Ok(jwk);
        }

        let row = self
            .repo
            .find_session_jwk_by_kid(kid)
            .await?
            .ok_or(Error::Session(SessionError::UnknownKid))?;
        if !row.usable_for_validation(now) {
            // The key's validity window closed but the sweep has not run
            // yet: tokens under it are revoked, not merely unknown.
            return Err(Error::Session(SessionError::Revoked));
        }

        let json = self.barrier.decrypt(&row.wrapped_jwk).await?;
        let jwk = Jwk::from_json(&json).map_err(|_| Error::Session(SessionError::Malformed))?;
        Ok(self.cache.insert(jwk).await)
    }

    /// Active JWK for `(tenant, use)`, rotating lazily when missing or past
    /// the TTL.
    async fn ensure_active_jwk(&self, tenant_id: &str, key_use: KeyUse) -> Result<Arc<Jwk>> {
        let use_str = key_use_str(key_use);
        if let Some(row) = self.repo.find_active_session_jwk(tenant_id, use_str).await? {
            let fresh = DateTime::parse_from_rfc3339(&row.created_at)
                .map(|created| {
                    Utc::now()
                        .signed_duration_since(created.with_timezone(&Utc))
                        .num_seconds()
                        < self.config.ttl_secs as i64
                })
                .unwrap_or(false);
            if fresh {
                if let Some(jwk) = self.cache.get(&row.kid).await {
                    return Ok(jwk);
                }
                let json = self.barrier.decrypt(&row.wrapped_jwk).await?;
                let jwk = Jwk::from_json(&json)?;
                return Ok(self.cache.insert(jwk).await);
            }
        }
        self.rotate_tenant_key(tenant_id, key_use).await
    }

    /// Generate, wrap, and activate a fresh session JWK for the tenant.
    async fn rotate_tenant_key(&self, tenant_id: &str, key_use: KeyUse) -> Result<Arc<Jwk>> {
        let algorithm = match key_use {
            KeyUse::Signature => self.config.signing_algorithm.as_str(),
            KeyUse::Encryption => SESSION_ENC,
        };
        let entry = registry::lookup(algorithm)?;
        let material = KeyMaterial::generate(entry)?;
        let jwk = material.to_jwk(entry, key_use)?;

        let wrapped = self.barrier.encrypt(jwk.to_json()?.as_bytes()).await?;
        let now = Utc::now();
        // The validity window covers the key's active period plus the
        // lifetime of the last token it could have issued.
        let expires = now + chrono::Duration::seconds(2 * self.config.ttl_secs as i64);

        let row = SessionJwkRow {
            kid: jwk.kid.clone(),
            tenant_id: tenant_id.to_string(),
            key_use: key_use_str(key_use).to_string(),
            algorithm: algorithm.to_string(),
            wrapped_jwk: wrapped,
            created_at: now.to_rfc3339(),
            expires_at: expires.to_rfc3339(),
            active: true,
        };
        self.repo.activate_session_jwk(&row).await?;

        tracing::info!(
            tenant_id,
            kid = %jwk.kid,
            algorithm,
            key_use = key_use_str(key_use),
            "session key rotated"
        );
        Ok(self.cache.insert(jwk).await)
    }
}

fn key_use_str(key_use: KeyUse) -> &'static str {
    match key_use {
        KeyUse::Signature => "sig",
        KeyUse::Encryption => "enc",
    }
}

fn map_verify_error(e: jws::VerifyError) -> SessionError {
    match e {
        jws::VerifyError::Expired => SessionError::Expired,
        jws::VerifyError::BadSignature => SessionError::Signature,
        jws::VerifyError::WrongAudience => SessionError::WrongAudience,
        jws::VerifyError::Malformed(_) => SessionError::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BarrierConfig, UnsealConfig};
    use std::io::Write;
    use tempfile::TempDir;

    async fn manager_with(config: SessionConfig) -> (Arc<SessionManager>, TempDir) {
        let repo = Arc::new(Repository::connect_in_memory().await.unwrap());
        repo.migrate(&[]).await.unwrap();

        let dir = TempDir::new().unwrap();
        let share_files = (0..3)
            .map(|i| {
                let path = dir.path().join(format!("share-{i}"));
                let mut file = std::fs::File::create(&path).unwrap();
                file.write_all(&[i as u8 + 1; 32]).unwrap();
                path
            })
            .collect();
        let barrier_config = BarrierConfig {
            unseal: UnsealConfig {
                shares_required: 3,
                share_files,
            },
            rotation: Default::default(),
        };
        let barrier = Arc::new(
            Barrier::unseal(repo.clone(), &barrier_config, "session-tests")
                .await
                .unwrap(),
        );

        let manager = Arc::new(SessionManager::new(
            repo,
            barrier,
            config,
            "session-tests",
            "session-tests",
        ));
        (manager, dir)
    }

    fn default_config() -> SessionConfig {
        SessionConfig {
            ttl_secs: 60,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn jws_session_round_trip() {
        let (manager, _dir) = manager_with(default_config()).await;
        let issued = manager
            .issue_session("tenant-1", "user-1", "default", None, None)
            .await
            .unwrap();

        let claims = manager.validate_session(&issued.token).await.unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.tenant_id, "tenant-1");
        assert_eq!(claims.jti, issued.claims.jti);
    }

    #[tokio::test]
    async fn jwe_session_round_trip() {
        let (manager, _dir) = manager_with(default_config()).await;
        let issued = manager
            .issue_session(
                "tenant-1",
                "user-1",
                "default",
                Some(SessionForm::Jwe),
                None,
            )
            .await
            .unwrap();

        // Five-part compact JWE, opaque claims.
        assert_eq!(issued.token.matches('.').count(), 4);
        let claims = manager.validate_session(&issued.token).await.unwrap();
        assert_eq!(claims.sub, "user-1");
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let (manager, _dir) = manager_with(default_config()).await;
        let issued = manager
            .issue_session(
                "tenant-1",
                "user-1",
                "default",
                None,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(matches!(
            manager.validate_session(&issued.token).await.unwrap_err(),
            Error::Session(SessionError::Expired)
        ));
    }

    #[tokio::test]
    async fn tokens_survive_key_rotation_within_window() {
        let (manager, _dir) = manager_with(default_config()).await;
        let issued = manager
            .issue_session("tenant-1", "user-1", "default", None, None)
            .await
            .unwrap();

        manager
            .rotate_tenant_key("tenant-1", KeyUse::Signature)
            .await
            .unwrap();

        // New issuance uses the new key; the outstanding token still
        // validates against the retired row.
        let fresh = manager
            .issue_session("tenant-1", "user-1", "default", None, None)
            .await
            .unwrap();
        assert_ne!(
            jws::peek_kid(&issued.token).unwrap(),
            jws::peek_kid(&fresh.token).unwrap()
        );
        manager.validate_session(&issued.token).await.unwrap();
        manager.validate_session(&fresh.token).await.unwrap();
    }

    #[tokio::test]
    async fn token_from_unknown_key_set_is_rejected() {
        let (manager, _dir) = manager_with(default_config()).await;
        let (stranger, _dir2) = manager_with(default_config()).await;

        let foreign = stranger
            .issue_session("tenant-1", "user-1", "default", None, None)
            .await
            .unwrap();
        assert!(matches!(
            manager.validate_session(&foreign.token).await.unwrap_err(),
            Error::Session(SessionError::UnknownKid)
        ));
    }

    #[tokio::test]
    async fn garbage_tokens_are_malformed() {
        let (manager, _dir) = manager_with(default_config()).await;
        for garbage in ["", "abc", "a.b", "a.b.c.d.e.f.g"] {
            assert!(matches!(
                manager.validate_session(garbage).await.unwrap_err(),
                Error::Session(SessionError::Malformed)
            ));
        }
    }

    #[tokio::test]
    async fn cleanup_rotates_stale_active_keys() {
        let config = SessionConfig {
            ttl_secs: 0, // everything is immediately stale
            ..Default::default()
        };
        let (manager, _dir) = manager_with(config).await;
        let issued = manager
            .issue_session("tenant-1", "user-1", "default", None, None)
            .await
            .unwrap();
        let first_kid = jws::peek_kid(&issued.token).unwrap();

        manager.run_cleanup_once().await.unwrap();

        let active = manager
            .repo
            .find_active_session_jwk("tenant-1", "sig")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(active.kid, first_kid);
    }

    #[tokio::test]
    async fn csrf_token_is_bound_to_the_issued_session() {
        let (manager, _dir) = manager_with(default_config()).await;
        let issued = manager
            .issue_session("tenant-1", "user-1", "default", None, None)
            .await
            .unwrap();

        assert!(manager.csrf().verify(&issued.claims.jti, &issued.csrf_token));
        assert!(!manager.csrf().verify("other-jti", &issued.csrf_token));
    }
}
