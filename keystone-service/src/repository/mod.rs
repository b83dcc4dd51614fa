//! Transactional persistence over two engines
//!
//! One `Repository` fronts both supported engines: embedded file-backed
//! SQLite (WAL, busy timeout) and networked PostgreSQL. Every query is
//! written once with `$N` placeholders, each used once in order, which both
//! engines accept; row structs derive [`sqlx::FromRow`] and stick to
//! cross-engine column types (TEXT uuids, TEXT RFC 3339 timestamps, TEXT
//! serialized JSON, BOOLEAN flags).
//!
//! Writes happen inside a [`RepoTx`]: commit on clean return, automatic
//! rollback on drop. SQLite allows a single writer, so in embedded mode the
//! transaction additionally holds an internal async mutex; concurrency tests
//! that need parallel writers use the networked engine.
//!
//! This module never imports the barrier. Barrier-protected columns are
//! opaque strings here.

mod migrate;
mod rows;
mod stores;

pub use migrate::{template_migrations, Migration, DOMAIN_VERSION_FLOOR};
pub use rows::{
    BarrierKeyKind, BarrierKeyRow, RealmRow, SessionJwkRow, SessionKeyState, TenantRow, UserRow,
};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{PgPool, Postgres, Sqlite, SqlitePool, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::{DatabaseConfig, DatabaseDriver};
use crate::error::{map_sqlx_error, Error, Result, StorageOperation};

/// Connection pool over one of the two engines
pub enum DbPool {
    /// File-backed SQLite
    Embedded(SqlitePool),
    /// Networked PostgreSQL
    Networked(PgPool),
}

/// In-flight transaction over one of the two engines
pub enum DbTx {
    Embedded(Transaction<'static, Sqlite>),
    Networked(Transaction<'static, Postgres>),
}

/// Run a query against whichever pool is configured.
///
/// The body is expanded per engine so sqlx can infer the driver; both arms
/// must produce the same result type (map engine-specific results first).
/// Exported so composed services can run their own domain queries over the
/// same pool.
#[macro_export]
macro_rules! on_pool {
    ($pool:expr, $p:ident => $body:expr) => {
        match $pool {
            $crate::repository::DbPool::Embedded($p) => $body.await,
            $crate::repository::DbPool::Networked($p) => $body.await,
        }
    };
}

/// Run a query against an open transaction, either engine.
#[macro_export]
macro_rules! on_tx {
    ($tx:expr, $c:ident => $body:expr) => {
        match &mut $tx.inner {
            $crate::repository::DbTx::Embedded(tx) => {
                let $c = &mut **tx;
                $body.await
            }
            $crate::repository::DbTx::Networked(tx) => {
                let $c = &mut **tx;
                $body.await
            }
        }
    };
}

/// A scoped write transaction.
///
/// Commit is explicit; dropping without commit rolls back. In embedded mode
/// the transaction holds the single-writer gate for its whole lifetime.
pub struct RepoTx {
    /// Engine transaction; reach it through [`on_tx!`](crate::on_tx).
    pub inner: DbTx,
    _write_gate: Option<OwnedMutexGuard<()>>,
}

impl RepoTx {
    /// Commit the transaction.
    pub async fn commit(self) -> Result<()> {
        let result = match self.inner {
            DbTx::Embedded(tx) => tx.commit().await,
            DbTx::Networked(tx) => tx.commit().await,
        };
        result
            .map_err(|e| map_sqlx_error(StorageOperation::Transaction, e))
            .map_err(Error::from)
    }

    /// Roll back explicitly (dropping does the same).
    pub async fn rollback(self) -> Result<()> {
        let result = match self.inner {
            DbTx::Embedded(tx) => tx.rollback().await,
            DbTx::Networked(tx) => tx.rollback().await,
        };
        result
            .map_err(|e| map_sqlx_error(StorageOperation::Transaction, e))
            .map_err(Error::from)
    }
}

/// Transactional store for barrier keys, session JWKs, and tenancy rows.
pub struct Repository {
    pool: DbPool,
    write_gate: Option<Arc<Mutex<()>>>,
}

impl Repository {
    /// Open a repository for the configured engine.
    ///
    /// The embedded engine gets WAL journaling, a busy timeout, and
    /// create-if-missing; the networked engine gets a bounded pool with an
    /// acquire timeout. The networked DSN is read from the configured secret
    /// file, never from the environment.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        match config.driver {
            DatabaseDriver::Embedded => {
                let options = SqliteConnectOptions::new()
                    .filename(&config.path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
                    .foreign_keys(true);
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .connect_with(options)
                    .await
                    .map_err(|e| map_sqlx_error(StorageOperation::Connect, e))?;
                tracing::info!(path = %config.path.display(), "embedded database opened");
                Ok(Self {
                    pool: DbPool::Embedded(pool),
                    write_gate: Some(Arc::new(Mutex::new(()))),
                })
            }
            DatabaseDriver::Networked => {
                let dsn_file = config.dsn_file.as_ref().ok_or_else(|| {
                    Error::Config("database.driver=networked requires database.dsn_file".into())
                })?;
                let dsn = std::fs::read_to_string(dsn_file).map_err(|e| {
                    Error::Config(format!(
                        "failed to read DSN file '{}': {e}",
                        dsn_file.display()
                    ))
                })?;
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
                    .connect(dsn.trim())
                    .await
                    .map_err(|e| map_sqlx_error(StorageOperation::Connect, e))?;
                tracing::info!(
                    max_connections = config.max_connections,
                    "networked database pool created"
                );
                Ok(Self {
                    pool: DbPool::Networked(pool),
                    write_gate: None,
                })
            }
        }
    }

    /// Open an in-memory embedded repository (tests).
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .journal_mode(SqliteJournalMode::Memory);
        // A single connection: every handle must see the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error(StorageOperation::Connect, e))?;
        Ok(Self {
            pool: DbPool::Embedded(pool),
            write_gate: Some(Arc::new(Mutex::new(()))),
        })
    }

    /// The underlying engine pool, for composed services' domain queries
    /// (used with [`on_pool!`](crate::on_pool)).
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Begin a write transaction, acquiring the single-writer gate in
    /// embedded mode.
    pub async fn begin(&self) -> Result<RepoTx> {
        let write_gate = match &self.write_gate {
            Some(gate) => Some(gate.clone().lock_owned().await),
            None => None,
        };
        let inner = match &self.pool {
            DbPool::Embedded(pool) => pool
                .begin()
                .await
                .map(DbTx::Embedded)
                .map_err(|e| map_sqlx_error(StorageOperation::Transaction, e))?,
            DbPool::Networked(pool) => pool
                .begin()
                .await
                .map(DbTx::Networked)
                .map_err(|e| map_sqlx_error(StorageOperation::Transaction, e))?,
        };
        Ok(RepoTx {
            inner,
            _write_gate: write_gate,
        })
    }

    /// Cheap reachability probe for readiness checks.
    pub async fn ping(&self) -> Result<()> {
        on_pool!(&self.pool, p => async {
            sqlx::query("SELECT 1").execute(p).await.map(|_| ())
        })
        .map_err(|e| map_sqlx_error(StorageOperation::Query, e))?;
        Ok(())
    }
}

/// Retry a storage operation with exponential backoff while it reports
/// `Unavailable`. Other errors surface immediately.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Storage(e)) if e.is_retriable() && attempt + 1 < max_attempts => {
                attempt += 1;
                let delay = base_delay * 2u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "storage unavailable, retrying: {}",
                    e.message
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[tokio::test]
    async fn in_memory_repository_pings() {
        let repo = Repository::connect_in_memory().await.unwrap();
        repo.ping().await.unwrap();
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let mut calls = 0u32;
        let result: Result<()> = with_retry(3, Duration::from_millis(1), || {
            calls += 1;
            async {
                Err(Error::Storage(StorageError::unavailable(
                    StorageOperation::Query,
                    "down",
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_does_not_retry_conflicts() {
        let mut calls = 0u32;
        let result: Result<()> = with_retry(3, Duration::from_millis(1), || {
            calls += 1;
            async {
                Err(Error::Storage(StorageError::conflict(
                    StorageOperation::Insert,
                    "duplicate",
                )))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
