//! Service builder
//!
//! Composes the repository, barrier, session manager, value pool, middleware
//! chains, and the two listeners into an [`Application`]. Four configuration
//! points, all optional:
//!
//! - [`with_config`](ServiceBuilder::with_config): the per-instance
//!   configuration document (defaults otherwise).
//! - [`with_domain_migrations`](ServiceBuilder::with_domain_migrations):
//!   the service's schema set (versions ≥ 2001), merged with the template's.
//! - [`with_public_routes`](ServiceBuilder::with_public_routes): routes for
//!   the browser and service surfaces.
//! - [`with_admin_extensions`](ServiceBuilder::with_admin_extensions):
//!   extra admin-listener endpoints.
//!
//! ## Example
//!
//! ```rust,ignore
//! use keystone_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load_from("config.toml")?;
//!
//!     let mut app = ServiceBuilder::new()
//!         .with_config(config)
//!         .with_domain_migrations(vec![Migration::new(2001, "jose_keys", JOSE_KEYS_SQL)])
//!         .with_public_routes(|mut routes| {
//!             routes.service = routes.service.route("/keys", post(create_key));
//!             routes
//!         })
//!         .build()
//!         .await?;
//!
//!     app.start().await?;
//!     app.run_until_shutdown().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::health::AdminState;
use crate::observability;
use crate::repository::{with_retry, Migration, Repository};
use crate::server::{Application, PublicRoutes};

/// Builder for a keystone application.
pub struct ServiceBuilder {
    config: Option<Config>,
    domain_migrations: Vec<Migration>,
    public_routes: Option<Box<dyn FnOnce(PublicRoutes) -> PublicRoutes + Send>>,
    admin_extension:
        Option<Box<dyn FnOnce(axum::Router<AdminState>) -> axum::Router<AdminState> + Send>>,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBuilder {
    /// A builder with no configuration points set.
    pub fn new() -> Self {
        Self {
            config: None,
            domain_migrations: Vec::new(),
            public_routes: None,
            admin_extension: None,
        }
    }

    /// Set the configuration (validated before use).
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Supply the domain migration set (versions ≥ 2001).
    pub fn with_domain_migrations(mut self, migrations: Vec<Migration>) -> Self {
        self.domain_migrations = migrations;
        self
    }

    /// Register routes on the public surfaces.
    ///
    /// Paths are relative to the surface prefixes: browser routes end up
    /// under `/browser/api/v1`, service routes under `/service/api/v1`, each
    /// behind its own middleware chain.
    pub fn with_public_routes<F>(mut self, register: F) -> Self
    where
        F: FnOnce(PublicRoutes) -> PublicRoutes + Send + 'static,
    {
        self.public_routes = Some(Box::new(register));
        self
    }

    /// Extend the admin router (health endpoints stay; extensions add to
    /// them).
    pub fn with_admin_extensions<F>(mut self, extend: F) -> Self
    where
        F: FnOnce(axum::Router<AdminState>) -> axum::Router<AdminState> + Send + 'static,
    {
        self.admin_extension = Some(Box::new(extend));
        self
    }

    /// Validate configuration, initialize tracing, open the repository, and
    /// assemble the (not yet started) [`Application`].
    ///
    /// Startup work that must be observable through `/readyz` — migrations,
    /// unseal, listeners — happens in [`Application::start`].
    pub async fn build(self) -> Result<Application> {
        let config = match self.config {
            Some(config) => {
                config.validate()?;
                config
            }
            None => Config::default(),
        };
        let config = Arc::new(config);

        observability::init_tracing(&config)?;

        let repo = with_retry(3, Duration::from_millis(500), || {
            Repository::connect(&config.database)
        })
        .await?;
        let repo = Arc::new(repo);

        let app = Application::new(
            config,
            repo,
            self.domain_migrations,
            self.public_routes,
            self.admin_extension,
        );
        Ok(app)
    }
}
