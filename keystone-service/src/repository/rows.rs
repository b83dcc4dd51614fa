//! Persisted row types
//!
//! Column types are restricted to what both engines share: TEXT for uuids,
//! timestamps (RFC 3339), JSON and wrapped JWE material; BOOLEAN for flags;
//! BIGINT for counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three barrier key levels, as stored in `barrier_keys.kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierKeyKind {
    RootKey,
    IntermediateKey,
    ContentKey,
}

impl BarrierKeyKind {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RootKey => "root_key",
            Self::IntermediateKey => "intermediate_key",
            Self::ContentKey => "content_key",
        }
    }
}

impl fmt::Display for BarrierKeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One barrier key row; `wrapped_material` is a compact JWE under the key at
/// the level above (the shared-secret key for roots).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BarrierKeyRow {
    pub kid: String,
    pub kind: String,
    pub wrapped_material: String,
    pub created_at: String,
    pub active: bool,
    pub valid_for_decrypt: bool,
}

impl BarrierKeyRow {
    /// Build a fresh active row.
    pub fn new_active(kid: String, kind: BarrierKeyKind, wrapped_material: String) -> Self {
        Self {
            kid,
            kind: kind.as_str().to_string(),
            wrapped_material,
            created_at: Utc::now().to_rfc3339(),
            active: true,
            valid_for_decrypt: true,
        }
    }
}

/// Lifecycle of a session JWK row.
///
/// `PENDING` exists only between insert and the activation flip inside the
/// same transaction; it is never observable through the store API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKeyState {
    Pending,
    Active,
    Retired,
    Expired,
    Purged,
}

/// One session JWK row; `wrapped_jwk` is barrier ciphertext.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionJwkRow {
    pub kid: String,
    pub tenant_id: String,
    pub key_use: String,
    pub algorithm: String,
    pub wrapped_jwk: String,
    pub created_at: String,
    pub expires_at: String,
    pub active: bool,
}

impl SessionJwkRow {
    /// Derive the observable lifecycle state at `now`.
    ///
    /// A row that is gone from the table is `Purged`; that case is
    /// represented by the row's absence, not a variant of the row.
    pub fn state_at(&self, now: DateTime<Utc>) -> SessionKeyState {
        if self.active {
            return SessionKeyState::Active;
        }
        match DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(expires) if expires.with_timezone(&Utc) < now => SessionKeyState::Expired,
            _ => SessionKeyState::Retired,
        }
    }

    /// True while tokens issued under this key may still be inside their
    /// validity window.
    pub fn usable_for_validation(&self, now: DateTime<Utc>) -> bool {
        !matches!(self.state_at(now), SessionKeyState::Expired)
    }
}

/// Tenant row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantRow {
    pub tenant_id: String,
    pub name: String,
    pub created_at: String,
}

/// Realm row: an authentication policy bundle within a tenant
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RealmRow {
    pub realm_id: String,
    pub tenant_id: String,
    pub name: String,
    pub session_form: String,
    pub session_ttl_secs: i64,
    pub created_at: String,
}

/// User row; `password_hash` is PBKDF2 + pepper, never plaintext
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub user_id: String,
    pub tenant_id: String,
    pub realm_id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn jwk_row(active: bool, expires_in: Duration) -> SessionJwkRow {
        SessionJwkRow {
            kid: "k1".into(),
            tenant_id: "t1".into(),
            key_use: "sig".into(),
            algorithm: "ES256".into(),
            wrapped_jwk: "jwe".into(),
            created_at: Utc::now().to_rfc3339(),
            expires_at: (Utc::now() + expires_in).to_rfc3339(),
            active,
        }
    }

    #[test]
    fn active_row_is_active() {
        let now = Utc::now();
        assert_eq!(
            jwk_row(true, Duration::hours(1)).state_at(now),
            SessionKeyState::Active
        );
    }

    #[test]
    fn retired_row_expires_when_window_passes() {
        let now = Utc::now();
        let retired = jwk_row(false, Duration::hours(1));
        assert_eq!(retired.state_at(now), SessionKeyState::Retired);
        assert!(retired.usable_for_validation(now));

        let expired = jwk_row(false, Duration::hours(-1));
        assert_eq!(expired.state_at(now), SessionKeyState::Expired);
        assert!(!expired.usable_for_validation(now));
    }

    #[test]
    fn barrier_kind_round_trips_through_storage_form() {
        for kind in [
            BarrierKeyKind::RootKey,
            BarrierKeyKind::IntermediateKey,
            BarrierKeyKind::ContentKey,
        ] {
            assert!(!kind.as_str().is_empty());
        }
        assert_eq!(BarrierKeyKind::RootKey.as_str(), "root_key");
    }
}
