//! Merged schema migrations
//!
//! Two ordered sets feed one runner: the template set embedded in this crate
//! (versions 1001–1099) and a per-service domain set (versions ≥ 2001)
//! handed to the builder. The union is sorted by version, applied once, and
//! recorded in `schema_versions`. Down files ship next to the up files but
//! are operator tooling, never auto-applied.

use chrono::Utc;

use super::Repository;
use crate::error::{map_sqlx_error, Error, Result, StorageError, StorageOperation};
use crate::{on_pool, on_tx};

/// Template versions live below this; domain schemas at or above it.
pub const DOMAIN_VERSION_FLOOR: i64 = 2001;

const TEMPLATE_VERSION_MIN: i64 = 1001;
const TEMPLATE_VERSION_MAX: i64 = 1099;

/// One migration: a numeric version, a short description, and the up SQL.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub up: String,
}

impl Migration {
    /// Create a migration from its parts.
    pub fn new(version: i64, description: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            up: up.into(),
        }
    }
}

/// The template schema set embedded in this crate.
pub fn template_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1001,
            "barrier_keys",
            include_str!("../../migrations/1001_barrier_keys.up.sql"),
        ),
        Migration::new(
            1002,
            "session_jwks",
            include_str!("../../migrations/1002_session_jwks.up.sql"),
        ),
        Migration::new(
            1003,
            "tenancy",
            include_str!("../../migrations/1003_tenancy.up.sql"),
        ),
    ]
}

#[derive(Debug, sqlx::FromRow)]
struct AppliedRow {
    version: i64,
    description: String,
}

impl Repository {
    /// Apply the merged template + domain migration sets.
    ///
    /// Aborts (and thereby aborts startup) on: a domain version below the
    /// floor, a duplicate version in the union, a recorded version whose
    /// description no longer matches, or any failing statement.
    pub async fn migrate(&self, domain: &[Migration]) -> Result<()> {
        for m in domain {
            if m.version < DOMAIN_VERSION_FLOOR {
                return Err(StorageError::schema_stale(format!(
                    "domain migration {} is below the floor of {DOMAIN_VERSION_FLOOR}",
                    m.version
                ))
                .into());
            }
        }

        let mut merged: Vec<Migration> = template_migrations();
        debug_assert!(merged
            .iter()
            .all(|m| (TEMPLATE_VERSION_MIN..=TEMPLATE_VERSION_MAX).contains(&m.version)));
        merged.extend(domain.iter().cloned());
        merged.sort_by_key(|m| m.version);

        for pair in merged.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(StorageError::schema_stale(format!(
                    "duplicate migration version {}",
                    pair[0].version
                ))
                .into());
            }
        }

        self.ensure_version_table().await?;
        let applied = self.applied_versions().await?;

        for migration in &merged {
            match applied.iter().find(|a| a.version == migration.version) {
                Some(row) if row.description == migration.description => continue,
                Some(row) => {
                    return Err(StorageError::schema_stale(format!(
                        "version {} recorded as '{}' but merged set says '{}'",
                        row.version, row.description, migration.description
                    ))
                    .into());
                }
                None => self.apply_one(migration).await?,
            }
        }

        tracing::info!(
            total = merged.len(),
            newly_applied = merged.len() - applied.len(),
            "schema migrations complete"
        );
        Ok(())
    }

    async fn ensure_version_table(&self) -> Result<()> {
        const SQL: &str = "CREATE TABLE IF NOT EXISTS schema_versions (\
             version BIGINT PRIMARY KEY, \
             description TEXT NOT NULL, \
             applied_at TEXT NOT NULL)";
        let mut tx = self.begin().await?;
        on_tx!(tx, c => async {
            sqlx::raw_sql(SQL).execute(c).await.map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Migration, e))?;
        tx.commit().await
    }

    async fn applied_versions(&self) -> Result<Vec<AppliedRow>> {
        const SQL: &str = "SELECT version, description FROM schema_versions ORDER BY version";
        on_pool!(self.pool(), p => async {
            sqlx::query_as::<_, AppliedRow>(SQL).fetch_all(p).await
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Migration, e))
        .map_err(Error::from)
    }

    async fn apply_one(&self, migration: &Migration) -> Result<()> {
        tracing::info!(
            version = migration.version,
            description = %migration.description,
            "applying migration"
        );

        let mut tx = self.begin().await?;
        on_tx!(tx, c => async {
            sqlx::raw_sql(&migration.up).execute(c).await.map(|_| ())
        })
        .map_err(|e| {
            StorageError::new(
                StorageOperation::Migration,
                crate::error::StorageErrorKind::Other,
                format!("migration {} failed: {e}", migration.version),
            )
        })?;

        const RECORD: &str =
            "INSERT INTO schema_versions (version, description, applied_at) VALUES ($1, $2, $3)";
        let applied_at = Utc::now().to_rfc3339();
        on_tx!(tx, c => async {
            sqlx::query(RECORD)
                .bind(migration.version)
                .bind(&migration.description)
                .bind(&applied_at)
                .execute(c)
                .await
                .map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Migration, e))?;

        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> Repository {
        Repository::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn template_set_applies_cleanly() {
        let repo = repo().await;
        repo.migrate(&[]).await.unwrap();
        // Applying again is a no-op.
        repo.migrate(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn domain_set_merges_after_template() {
        let repo = repo().await;
        let domain = vec![Migration::new(
            2001,
            "jose_keys",
            "CREATE TABLE jose_keys (kid TEXT PRIMARY KEY, tenant_id TEXT NOT NULL)",
        )];
        repo.migrate(&domain).await.unwrap();
        let applied = repo.applied_versions().await.unwrap();
        let versions: Vec<i64> = applied.iter().map(|a| a.version).collect();
        assert_eq!(versions, vec![1001, 1002, 1003, 2001]);
    }

    #[tokio::test]
    async fn domain_version_below_floor_rejected() {
        let repo = repo().await;
        let domain = vec![Migration::new(1500, "sneaky", "SELECT 1")];
        let err = repo.migrate(&domain).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn duplicate_versions_rejected() {
        let repo = repo().await;
        let domain = vec![
            Migration::new(2001, "a", "CREATE TABLE a (x TEXT)"),
            Migration::new(2001, "b", "CREATE TABLE b (x TEXT)"),
        ];
        assert!(repo.migrate(&domain).await.is_err());
    }

    #[tokio::test]
    async fn changed_description_is_stale_schema() {
        let repo = repo().await;
        repo.migrate(&[Migration::new(2001, "a", "CREATE TABLE a (x TEXT)")])
            .await
            .unwrap();
        let err = repo
            .migrate(&[Migration::new(2001, "renamed", "CREATE TABLE a (x TEXT)")])
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn failing_statement_aborts() {
        let repo = repo().await;
        let domain = vec![Migration::new(2001, "broken", "CREATE TBLE broken (x TEXT)")];
        let err = repo.migrate(&domain).await.unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
