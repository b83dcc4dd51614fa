//! Domain persistence for issued keys
//!
//! Uses the template repository's engine pool through the exported query
//! macros; every query is tenant-scoped.

use keystone_service::error::{map_sqlx_error, Error, Result, StorageOperation};
use keystone_service::repository::Repository;
use keystone_service::{on_pool, on_tx};

/// One issued key row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JoseKeyRow {
    pub kid: String,
    pub tenant_id: String,
    pub algorithm: String,
    pub key_use: String,
    pub public_jwk: String,
    pub wrapped_private_jwk: String,
    pub created_at: String,
}

/// Insert an issued key.
pub async fn insert_key(repo: &Repository, row: &JoseKeyRow) -> Result<()> {
    const SQL: &str = "INSERT INTO jose_keys \
        (kid, tenant_id, algorithm, key_use, public_jwk, wrapped_private_jwk, created_at) \
        VALUES ($1, $2, $3, $4, $5, $6, $7)";
    let mut tx = repo.begin().await?;
    on_tx!(tx, c => async {
        sqlx::query(SQL)
            .bind(&row.kid)
            .bind(&row.tenant_id)
            .bind(&row.algorithm)
            .bind(&row.key_use)
            .bind(&row.public_jwk)
            .bind(&row.wrapped_private_jwk)
            .bind(&row.created_at)
            .execute(c)
            .await
            .map(|_| ())
    })
    .map_err(|e| map_sqlx_error(StorageOperation::Insert, e))?;
    tx.commit().await
}

/// Fetch a key by kid within a tenant.
pub async fn find_key(repo: &Repository, tenant_id: &str, kid: &str) -> Result<Option<JoseKeyRow>> {
    const SQL: &str = "SELECT * FROM jose_keys WHERE tenant_id = $1 AND kid = $2";
    on_pool!(repo.pool(), p => async {
        sqlx::query_as::<_, JoseKeyRow>(SQL)
            .bind(tenant_id)
            .bind(kid)
            .fetch_optional(p)
            .await
    })
    .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
    .map_err(Error::from)
}

/// List a tenant's keys, newest first.
pub async fn list_keys(repo: &Repository, tenant_id: &str) -> Result<Vec<JoseKeyRow>> {
    const SQL: &str =
        "SELECT * FROM jose_keys WHERE tenant_id = $1 ORDER BY created_at DESC";
    on_pool!(repo.pool(), p => async {
        sqlx::query_as::<_, JoseKeyRow>(SQL)
            .bind(tenant_id)
            .fetch_all(p)
            .await
    })
    .map_err(|e| map_sqlx_error(StorageOperation::Query, e))
    .map_err(Error::from)
}
