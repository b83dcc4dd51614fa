//! # keystone-service
//!
//! Service template for the keystone identity and cryptographic service
//! suite. Every service in the suite — authorization server, identity
//! provider, resource server, JOSE key issuance, cipher messaging, KMS —
//! composes the same core:
//!
//! - **Barrier**: a three-level key-encryption hierarchy (Unseal → Root →
//!   Intermediate → Content) protecting all at-rest key material, with
//!   per-level rotation and an M-of-N unseal bootstrap.
//! - **Session manager**: short-lived JWS or JWE session tokens, per-realm
//!   policy, barrier-wrapped signing keys, periodic cleanup.
//! - **Dual-HTTPS serving**: an isolated public listener with disjoint
//!   `/browser/**` and `/service/**` middleware chains, and an admin
//!   listener for `/livez`, `/readyz`, and shutdown.
//! - **Repository**: transactional multi-tenant persistence over embedded
//!   SQLite or networked PostgreSQL, with merged template + domain
//!   migrations.
//! - **Value pool**: pre-generated UUIDs, random bytes, and ephemeral keys
//!   with age- and count-based eviction.
//!
//! ## Example
//!
//! ```rust,no_run
//! use keystone_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load_from("config.toml")?;
//!
//!     let mut app = ServiceBuilder::new()
//!         .with_config(config)
//!         .build()
//!         .await?;
//!
//!     app.start().await?;
//!     app.run_until_shutdown().await
//! }
//! ```

pub mod barrier;
pub mod config;
pub mod crypto;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod repository;
pub mod server;
pub mod service_builder;
pub mod session;
pub mod state;
pub mod tls;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        Config, DatabaseDriver, SessionForm, TelemetryProtocol, TlsMode,
    };
    pub use crate::error::{
        BarrierError, CryptoError, Error, ErrorResponse, PolicyError, Result, SessionError,
        StorageError, StorageErrorKind,
    };

    pub use crate::barrier::Barrier;
    pub use crate::crypto::{registry, Jwk, KeyMaterial, KeyUse};
    pub use crate::generator::{PoolConfig, PooledValue, ValueKind, ValuePool};
    pub use crate::handlers::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
    pub use crate::health::AdminState;
    pub use crate::middleware::SessionContext;
    pub use crate::repository::{Migration, Repository};
    pub use crate::server::{Application, Lifecycle, LifecycleState, PublicRoutes};
    pub use crate::service_builder::ServiceBuilder;
    pub use crate::session::{IssuedSession, SessionClaims, SessionManager};
    pub use crate::state::AppState;

    pub use axum::{
        extract::{Extension, Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Router,
    };

    pub use serde::{Deserialize, Serialize};

    // Re-export tracing macros and types
    pub use tracing::{debug, error, info, instrument, trace, warn};

    // Re-export the async runtime and cancellation primitives
    pub use tokio;
    pub use tokio_util::sync::CancellationToken;

    // Re-export error handling utilities
    pub use anyhow::{self, Context as AnyhowContext};
    pub use thiserror::Error as ThisError;

    // Re-export time utilities
    pub use chrono::{DateTime, Utc};

    // Re-export UUID
    pub use uuid::Uuid;
}
