//! Row stores
//!
//! Concrete upsert/find/list operations for the §template tables. Reads run
//! on the pool; writes that must be atomic (rotation's insert + flip) take a
//! [`RepoTx`](super::RepoTx).

use chrono::{DateTime, Utc};

use super::{
    BarrierKeyKind, BarrierKeyRow, RealmRow, RepoTx, Repository, SessionJwkRow, TenantRow, UserRow,
};
use crate::error::{map_sqlx_error, Error, Result, StorageError, StorageOperation};
use crate::{on_pool, on_tx};

// ----------------------------------------------------------------------------
// Barrier keys
// ----------------------------------------------------------------------------

impl Repository {
    /// Insert a barrier key row inside a transaction.
    pub async fn insert_barrier_key_tx(&self, tx: &mut RepoTx, row: &BarrierKeyRow) -> Result<()> {
        const SQL: &str = "INSERT INTO barrier_keys \
            (kid, kind, wrapped_material, created_at, active, valid_for_decrypt) \
            VALUES ($1, $2, $3, $4, $5, $6)";
        on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(&row.kid)
                .bind(&row.kind)
                .bind(&row.wrapped_material)
                .bind(&row.created_at)
                .bind(row.active)
                .bind(row.valid_for_decrypt)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Insert, e))?;
        Ok(())
    }

    /// Flip a key's `active` flag off inside a transaction (rotation).
    pub async fn deactivate_barrier_key_tx(
        &self,
        tx: &mut RepoTx,
        kind: BarrierKeyKind,
        kid: &str,
    ) -> Result<()> {
        const SQL: &str =
            "UPDATE barrier_keys SET active = FALSE WHERE kind = $1 AND kid = $2";
        on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(kind.as_str())
                .bind(kid)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Update, e))?;
        Ok(())
    }

    /// The single active key at a level, if any.
    pub async fn find_active_barrier_key(
        &self,
        kind: BarrierKeyKind,
    ) -> Result<Option<BarrierKeyRow>> {
        const SQL: &str =
            "SELECT * FROM barrier_keys WHERE kind = $1 AND active = TRUE";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, BarrierKeyRow>(SQL)
                .bind(kind.as_str())
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// A specific key row by level and kid.
    pub async fn find_barrier_key(
        &self,
        kind: BarrierKeyKind,
        kid: &str,
    ) -> Result<Option<BarrierKeyRow>> {
        const SQL: &str = "SELECT * FROM barrier_keys WHERE kind = $1 AND kid = $2";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, BarrierKeyRow>(SQL)
                .bind(kind.as_str())
                .bind(kid)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// All rows at a level, newest first.
    pub async fn list_barrier_keys(&self, kind: BarrierKeyKind) -> Result<Vec<BarrierKeyRow>> {
        const SQL: &str =
            "SELECT * FROM barrier_keys WHERE kind = $1 ORDER BY created_at DESC";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, BarrierKeyRow>(SQL)
                .bind(kind.as_str())
                .fetch_all(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// Administrative invalidation: mark a retired key unusable for
    /// decryption. Refuses the active key. Processes that already unwrapped
    /// the key keep it until restart; new resolutions honor the flag.
    pub async fn invalidate_barrier_key(&self, kind: BarrierKeyKind, kid: &str) -> Result<()> {
        const SQL: &str = "UPDATE barrier_keys SET valid_for_decrypt = FALSE \
            WHERE kind = $1 AND kid = $2 AND active = FALSE";
        let mut tx = self.begin().await?;
        let affected = on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(kind.as_str())
                .bind(kid)
                .execute(c)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Update, e))?;
        tx.commit().await?;

        if affected == 0 {
            return Err(StorageError::not_found(
                StorageOperation::Update,
                format!("{kind} {kid} not invalidatable (missing or still active)"),
            )
            .into());
        }
        Ok(())
    }

    /// Administrative purge; refuses keys still valid for decryption.
    pub async fn purge_barrier_key(&self, kind: BarrierKeyKind, kid: &str) -> Result<()> {
        const SQL: &str = "DELETE FROM barrier_keys \
            WHERE kind = $1 AND kid = $2 AND valid_for_decrypt = FALSE AND active = FALSE";
        let mut tx = self.begin().await?;
        let affected = on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(kind.as_str())
                .bind(kid)
                .execute(c)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Delete, e))?;
        tx.commit().await?;

        if affected == 0 {
            return Err(StorageError::not_found(
                StorageOperation::Delete,
                format!("{kind} {kid} not purgeable (missing, active, or still valid for decrypt)"),
            )
            .into());
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Session JWKs
// ----------------------------------------------------------------------------

impl Repository {
    /// Insert a session JWK row and deactivate the tenant's previous active
    /// key for the same use, atomically.
    pub async fn activate_session_jwk(&self, row: &SessionJwkRow) -> Result<()> {
        const RETIRE: &str = "UPDATE session_jwks SET active = FALSE \
            WHERE tenant_id = $1 AND key_use = $2 AND active = TRUE";
        const INSERT: &str = "INSERT INTO session_jwks \
            (kid, tenant_id, key_use, algorithm, wrapped_jwk, created_at, expires_at, active) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

        let mut tx = self.begin().await?;
        on_tx!(tx, c => async {
            sqlx::query(RETIRE)
                .bind(&row.tenant_id)
                .bind(&row.key_use)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Update, e))?;
        on_tx!(tx, c => async {
            sqlx::query(INSERT)
                .bind(&row.kid)
                .bind(&row.tenant_id)
                .bind(&row.key_use)
                .bind(&row.algorithm)
                .bind(&row.wrapped_jwk)
                .bind(&row.created_at)
                .bind(&row.expires_at)
                .bind(row.active)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Insert, e))?;
        tx.commit().await
    }

    /// The active session JWK for `(tenant, use)`.
    pub async fn find_active_session_jwk(
        &self,
        tenant_id: &str,
        key_use: &str,
    ) -> Result<Option<SessionJwkRow>> {
        const SQL: &str = "SELECT * FROM session_jwks \
            WHERE tenant_id = $1 AND key_use = $2 AND active = TRUE";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, SessionJwkRow>(SQL)
                .bind(tenant_id)
                .bind(key_use)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// A session JWK row by kid, tenant-scoped.
    pub async fn find_session_jwk(
        &self,
        tenant_id: &str,
        kid: &str,
    ) -> Result<Option<SessionJwkRow>> {
        const SQL: &str =
            "SELECT * FROM session_jwks WHERE tenant_id = $1 AND kid = $2";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, SessionJwkRow>(SQL)
                .bind(tenant_id)
                .bind(kid)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// A session JWK row by kid alone.
    ///
    /// Token validation starts from the kid in the token header, before any
    /// tenant is known; the tenant check happens against the returned row.
    pub async fn find_session_jwk_by_kid(&self, kid: &str) -> Result<Option<SessionJwkRow>> {
        const SQL: &str = "SELECT * FROM session_jwks WHERE kid = $1";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, SessionJwkRow>(SQL)
                .bind(kid)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// Every active session JWK row (cleanup-task rotation sweep).
    pub async fn list_active_session_jwks(&self) -> Result<Vec<SessionJwkRow>> {
        const SQL: &str = "SELECT * FROM session_jwks WHERE active = TRUE";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, SessionJwkRow>(SQL).fetch_all(p).await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// Sweep expired session JWKs (EXPIRED → PURGED). Rows whose expiry
    /// window still covers possible outstanding tokens are left alone.
    pub async fn purge_expired_session_jwks(&self, now: DateTime<Utc>) -> Result<u64> {
        const SQL: &str =
            "DELETE FROM session_jwks WHERE active = FALSE AND expires_at < $1";
        let mut tx = self.begin().await?;
        let affected = on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(now.to_rfc3339())
                .execute(c)
                .await
                .map(|r| r.rows_affected())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Delete, e))?;
        tx.commit().await?;
        Ok(affected)
    }
}

// ----------------------------------------------------------------------------
// Tenants, realms, users
// ----------------------------------------------------------------------------

impl Repository {
    /// Insert a tenant.
    pub async fn insert_tenant(&self, row: &TenantRow) -> Result<()> {
        const SQL: &str =
            "INSERT INTO tenants (tenant_id, name, created_at) VALUES ($1, $2, $3)";
        let mut tx = self.begin().await?;
        on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(&row.tenant_id)
                .bind(&row.name)
                .bind(&row.created_at)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Insert, e))?;
        tx.commit().await
    }

    /// Find a tenant by id.
    pub async fn find_tenant(&self, tenant_id: &str) -> Result<Option<TenantRow>> {
        const SQL: &str = "SELECT * FROM tenants WHERE tenant_id = $1";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, TenantRow>(SQL)
                .bind(tenant_id)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// Insert a realm.
    pub async fn insert_realm(&self, row: &RealmRow) -> Result<()> {
        const SQL: &str = "INSERT INTO realms \
            (realm_id, tenant_id, name, session_form, session_ttl_secs, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6)";
        let mut tx = self.begin().await?;
        on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(&row.realm_id)
                .bind(&row.tenant_id)
                .bind(&row.name)
                .bind(&row.session_form)
                .bind(row.session_ttl_secs)
                .bind(&row.created_at)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Insert, e))?;
        tx.commit().await
    }

    /// Find a realm within a tenant.
    pub async fn find_realm(&self, tenant_id: &str, realm_id: &str) -> Result<Option<RealmRow>> {
        const SQL: &str =
            "SELECT * FROM realms WHERE tenant_id = $1 AND realm_id = $2";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, RealmRow>(SQL)
                .bind(tenant_id)
                .bind(realm_id)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// Insert a user; `(tenant_id, username)` uniqueness surfaces as a
    /// conflict.
    pub async fn insert_user(&self, row: &UserRow) -> Result<()> {
        const SQL: &str = "INSERT INTO users \
            (user_id, tenant_id, realm_id, username, password_hash, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6)";
        let mut tx = self.begin().await?;
        on_tx!(tx, c => async {
            sqlx::query(SQL)
                .bind(&row.user_id)
                .bind(&row.tenant_id)
                .bind(&row.realm_id)
                .bind(&row.username)
                .bind(&row.password_hash)
                .bind(&row.created_at)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Insert, e))?;
        tx.commit().await
    }

    /// Find a user by username within a tenant.
    pub async fn find_user_by_username(
        &self,
        tenant_id: &str,
        username: &str,
    ) -> Result<Option<UserRow>> {
        const SQL: &str =
            "SELECT * FROM users WHERE tenant_id = $1 AND username = $2";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, UserRow>(SQL)
                .bind(tenant_id)
                .bind(username)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }

    /// Find a user by id within a tenant.
    pub async fn find_user(&self, tenant_id: &str, user_id: &str) -> Result<Option<UserRow>> {
        const SQL: &str =
            "SELECT * FROM users WHERE tenant_id = $1 AND user_id = $2";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, UserRow>(SQL)
                .bind(tenant_id)
                .bind(user_id)
                .fetch_optional(p)
                .await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
        .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageErrorKind;
    use uuid::Uuid;

    async fn migrated_repo() -> Repository {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.migrate(&[]).await.unwrap();
        repo
    }

    fn barrier_row(kind: BarrierKeyKind) -> BarrierKeyRow {
        BarrierKeyRow::new_active(Uuid::new_v4().to_string(), kind, "eyJ..wrapped".to_string())
    }

    fn user_row(tenant_id: &str, username: &str) -> UserRow {
        UserRow {
            user_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            realm_id: "default".to_string(),
            username: username.to_string(),
            password_hash: "pbkdf2-sha384$600000$c$d".to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn barrier_key_insert_and_rotation_flip() {
        let repo = migrated_repo().await;

        let first = barrier_row(BarrierKeyKind::ContentKey);
        let mut tx = repo.begin().await.unwrap();
        repo.insert_barrier_key_tx(&mut tx, &first).await.unwrap();
        tx.commit().await.unwrap();

        let active = repo
            .find_active_barrier_key(BarrierKeyKind::ContentKey)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.kid, first.kid);

        // Rotation: insert successor and flip predecessor in one transaction.
        let second = barrier_row(BarrierKeyKind::ContentKey);
        let mut tx = repo.begin().await.unwrap();
        repo.insert_barrier_key_tx(&mut tx, &second).await.unwrap();
        repo.deactivate_barrier_key_tx(&mut tx, BarrierKeyKind::ContentKey, &first.kid)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let active = repo
            .find_active_barrier_key(BarrierKeyKind::ContentKey)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.kid, second.kid);

        let all = repo
            .list_barrier_keys(BarrierKeyKind::ContentKey)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|row| row.valid_for_decrypt));
        assert_eq!(all.iter().filter(|row| row.active).count(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let repo = migrated_repo().await;
        let row = barrier_row(BarrierKeyKind::RootKey);
        {
            let mut tx = repo.begin().await.unwrap();
            repo.insert_barrier_key_tx(&mut tx, &row).await.unwrap();
            // tx dropped without commit
        }
        assert!(repo
            .find_active_barrier_key(BarrierKeyKind::RootKey)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_kid_is_conflict() {
        let repo = migrated_repo().await;
        let row = barrier_row(BarrierKeyKind::RootKey);

        let mut tx = repo.begin().await.unwrap();
        repo.insert_barrier_key_tx(&mut tx, &row).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        let err = repo
            .insert_barrier_key_tx(&mut tx, &row)
            .await
            .unwrap_err();
        match err {
            Error::Storage(e) => assert_eq!(e.kind, StorageErrorKind::Conflict),
            other => panic!("expected storage conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn purge_refuses_keys_still_valid_for_decrypt() {
        let repo = migrated_repo().await;
        let row = barrier_row(BarrierKeyKind::ContentKey);
        let mut tx = repo.begin().await.unwrap();
        repo.insert_barrier_key_tx(&mut tx, &row).await.unwrap();
        tx.commit().await.unwrap();

        assert!(repo
            .purge_barrier_key(BarrierKeyKind::ContentKey, &row.kid)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn invalidate_then_purge_removes_a_retired_key() {
        let repo = migrated_repo().await;
        let row = barrier_row(BarrierKeyKind::ContentKey);
        let mut tx = repo.begin().await.unwrap();
        repo.insert_barrier_key_tx(&mut tx, &row).await.unwrap();
        tx.commit().await.unwrap();

        // The active key cannot be invalidated.
        assert!(repo
            .invalidate_barrier_key(BarrierKeyKind::ContentKey, &row.kid)
            .await
            .is_err());

        let mut tx = repo.begin().await.unwrap();
        repo.deactivate_barrier_key_tx(&mut tx, BarrierKeyKind::ContentKey, &row.kid)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        repo.invalidate_barrier_key(BarrierKeyKind::ContentKey, &row.kid)
            .await
            .unwrap();
        repo.purge_barrier_key(BarrierKeyKind::ContentKey, &row.kid)
            .await
            .unwrap();
        assert!(repo
            .find_barrier_key(BarrierKeyKind::ContentKey, &row.kid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn session_jwk_activation_retires_predecessor() {
        let repo = migrated_repo().await;

        let make_row = || SessionJwkRow {
            kid: Uuid::new_v4().to_string(),
            tenant_id: "tenant-1".to_string(),
            key_use: "sig".to_string(),
            algorithm: "ES256".to_string(),
            wrapped_jwk: "wrapped".to_string(),
            created_at: Utc::now().to_rfc3339(),
            expires_at: (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            active: true,
        };

        let first = make_row();
        repo.activate_session_jwk(&first).await.unwrap();
        let second = make_row();
        repo.activate_session_jwk(&second).await.unwrap();

        let active = repo
            .find_active_session_jwk("tenant-1", "sig")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.kid, second.kid);

        let retired = repo
            .find_session_jwk("tenant-1", &first.kid)
            .await
            .unwrap()
            .unwrap();
        assert!(!retired.active);
    }

    #[tokio::test]
    async fn expired_session_jwks_are_swept() {
        let repo = migrated_repo().await;
        let row = SessionJwkRow {
            kid: Uuid::new_v4().to_string(),
            tenant_id: "tenant-1".to_string(),
            key_use: "sig".to_string(),
            algorithm: "ES256".to_string(),
            wrapped_jwk: "wrapped".to_string(),
            created_at: Utc::now().to_rfc3339(),
            expires_at: (Utc::now() - chrono::Duration::hours(1)).to_rfc3339(),
            active: false,
        };
        repo.activate_session_jwk(&row).await.unwrap();

        let swept = repo.purge_expired_session_jwks(Utc::now()).await.unwrap();
        assert_eq!(swept, 1);
        assert!(repo
            .find_session_jwk("tenant-1", &row.kid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn tenant_isolation_on_user_queries() {
        let repo = migrated_repo().await;
        for (id, name) in [("t1", "tenant one"), ("t2", "tenant two")] {
            repo.insert_tenant(&TenantRow {
                tenant_id: id.to_string(),
                name: name.to_string(),
                created_at: Utc::now().to_rfc3339(),
            })
            .await
            .unwrap();
        }

        let alice = user_row("t1", "alice");
        repo.insert_user(&alice).await.unwrap();

        // Same username visible only within the owning tenant.
        assert!(repo
            .find_user_by_username("t1", "alice")
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_user_by_username("t2", "alice")
            .await
            .unwrap()
            .is_none());
        assert!(repo.find_user("t2", &alice.user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_within_tenant_conflicts() {
        let repo = migrated_repo().await;
        repo.insert_tenant(&TenantRow {
            tenant_id: "t1".to_string(),
            name: "tenant one".to_string(),
            created_at: Utc::now().to_rfc3339(),
        })
        .await
        .unwrap();

        repo.insert_user(&user_row("t1", "alice")).await.unwrap();
        let err = repo.insert_user(&user_row("t1", "alice")).await.unwrap_err();
        match err {
            Error::Storage(e) => assert_eq!(e.kind, StorageErrorKind::Conflict),
            other => panic!("expected storage conflict, got {other:?}"),
        }
    }
}
