//! Application lifecycle and the dual-HTTPS listeners
//!
//! One process, two isolated listeners: the public listener carries business
//! traffic behind the middleware chains; the admin listener carries
//! `/livez`, `/readyz`, and the shutdown trigger. The lifecycle is a strict
//! state machine:
//!
//! ```text
//! NEW → STARTING → READY → DRAINING → STOPPED
//! ```
//!
//! `start` opens the admin listener first (so readiness is observable while
//! migrations and unseal run), then migrates, unseals the barrier, spawns
//! the background tasks, and finally opens the public listener. `shutdown`
//! is idempotent: it marks `/readyz` failing, waits up to the configured
//! grace for in-flight requests, then closes everything.

use axum::Router;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::barrier::Barrier;
use crate::config::Config;
use crate::crypto::kdf::PasswordHasher;
use crate::error::{Error, Result};
use crate::generator::{PoolConfig, ValueKind, ValuePool};
use crate::health::{self, AdminState};
use crate::middleware::{
    apply_browser_headers, browser_session_middleware, service_session_middleware, IpAllowlist,
    RateLimit, ServiceChainState,
};
use crate::repository::{Migration, Repository};
use crate::session::SessionManager;
use crate::state::AppState;
use crate::tls::{build_server_config, RemoteAddr, TlsListener};

/// Lifecycle states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    New = 0,
    Starting = 1,
    Ready = 2,
    Draining = 3,
    Stopped = 4,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::New,
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Shared lifecycle handle: the state machine plus the two cancellation
/// domains (workers and listeners).
pub struct Lifecycle {
    state: AtomicU8,
    /// Cancels background workers (pool, cleanup, rotation).
    root: CancellationToken,
    /// Completes the listeners' graceful-shutdown futures.
    drain: CancellationToken,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A fresh lifecycle in NEW.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::New as u8),
            root: CancellationToken::new(),
            drain: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move forward in the state machine; backwards transitions are ignored.
    pub fn advance(&self, to: LifecycleState) {
        let mut current = self.state.load(Ordering::SeqCst);
        while current < to as u8 {
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    tracing::info!(state = %to, "lifecycle transition");
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Token handed to background workers.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Trigger DRAINING: readiness starts failing, workers are cancelled,
    /// and the listeners begin their graceful shutdown. Idempotent.
    pub fn begin_drain(&self) {
        if self.state() >= LifecycleState::Draining {
            return;
        }
        self.advance(LifecycleState::Draining);
        self.root.cancel();
        self.drain.cancel();
    }

    /// Completes when draining has been requested.
    pub async fn drain_requested(&self) {
        self.drain.cancelled().await;
    }
}

/// Per-surface route contributions from the composed service.
///
/// Paths are relative: browser routes land under `/browser/api/v1`, service
/// routes under `/service/api/v1`.
pub struct PublicRoutes {
    pub browser: Router<AppState>,
    pub service: Router<AppState>,
}

impl Default for PublicRoutes {
    fn default() -> Self {
        Self {
            browser: Router::new(),
            service: Router::new(),
        }
    }
}

type PublicRouteRegistration = Box<dyn FnOnce(PublicRoutes) -> PublicRoutes + Send>;
type AdminExtension = Box<dyn FnOnce(Router<AdminState>) -> Router<AdminState> + Send>;

/// A built (but not yet started) application.
///
/// Produced by [`ServiceBuilder::build`](crate::service_builder::ServiceBuilder::build);
/// drive it with [`start`](Self::start) and [`run_until_shutdown`](Self::run_until_shutdown).
#[derive(Debug)]
pub struct Application {
    config: Arc<Config>,
    repo: Arc<Repository>,
    domain_migrations: Vec<Migration>,
    public_routes: Option<PublicRouteRegistration>,
    admin_extension: Option<AdminExtension>,
    lifecycle: Arc<Lifecycle>,
    state: Option<AppState>,
    public_addr: Option<SocketAddr>,
    admin_addr: Option<SocketAddr>,
    serve_handles: Vec<JoinHandle<()>>,
}

impl Application {
    pub(crate) fn new(
        config: Arc<Config>,
        repo: Arc<Repository>,
        domain_migrations: Vec<Migration>,
        public_routes: Option<PublicRouteRegistration>,
        admin_extension: Option<AdminExtension>,
    ) -> Self {
        Self {
            config,
            repo,
            domain_migrations,
            public_routes,
            admin_extension,
            lifecycle: Arc::new(Lifecycle::new()),
            state: None,
            public_addr: None,
            admin_addr: None,
            serve_handles: Vec::new(),
        }
    }

    /// Lifecycle handle (for tests and embedding).
    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Built application state; present once [`start`](Self::start) passed
    /// the unseal step.
    pub fn state(&self) -> Option<&AppState> {
        self.state.as_ref()
    }

    /// Actual public port (resolves port 0 after start).
    pub fn public_port(&self) -> Option<u16> {
        self.public_addr.map(|a| a.port())
    }

    /// Actual admin port (resolves port 0 after start).
    pub fn admin_port(&self) -> Option<u16> {
        self.admin_addr.map(|a| a.port())
    }

    /// Drive NEW → READY.
    ///
    /// Order matters: admin listener first (readiness observable), then
    /// migrations, then unseal, then background tasks, then the public
    /// listener.
    pub async fn start(&mut self) -> Result<()> {
        if self.lifecycle.state() != LifecycleState::New {
            return Err(Error::Internal(format!(
                "start called in lifecycle state {}",
                self.lifecycle.state()
            )));
        }
        self.lifecycle.advance(LifecycleState::Starting);

        let tls = build_server_config(&self.config.tls)?;

        // Admin listener.
        let admin_state = AdminState {
            lifecycle: self.lifecycle.clone(),
            repo: self.repo.clone(),
        };
        let mut admin_router = health::admin_router();
        if let Some(extend) = self.admin_extension.take() {
            admin_router = extend(admin_router);
        }
        let admin_app = admin_router.with_state(admin_state);
        let admin_tcp = TcpListener::bind(SocketAddr::new(
            self.config.admin.address,
            self.config.admin.port,
        ))
        .await?;
        let admin_addr = admin_tcp.local_addr()?;
        self.admin_addr = Some(admin_addr);
        let admin_listener = TlsListener::new(admin_tcp, tls.clone());
        let drain = self.lifecycle.drain.clone();
        self.serve_handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(admin_listener, admin_app)
                .with_graceful_shutdown(async move { drain.cancelled().await })
                .await
            {
                tracing::error!("admin listener failed: {e}");
            }
        }));
        tracing::info!(addr = %admin_addr, "admin listener open");

        // Migrations, then unseal.
        self.repo.migrate(&self.domain_migrations).await?;
        let barrier = Arc::new(
            Barrier::unseal(
                self.repo.clone(),
                &self.config.barrier,
                &self.config.service.name,
            )
            .await?,
        );
        barrier.spawn_rotation_tasks(&self.config.barrier, self.lifecycle.cancellation_token());

        // Background components.
        let values = Arc::new(ValuePool::spawn(
            &[
                ValueKind::Uuid,
                ValueKind::RandBytes32,
                ValueKind::EcKeypairP256,
            ],
            PoolConfig::default(),
            self.lifecycle.cancellation_token(),
        ));

        let sessions = Arc::new(SessionManager::new(
            self.repo.clone(),
            barrier.clone(),
            self.config.session.clone(),
            self.config.service.name.clone(),
            self.config.session_audience().to_string(),
        ));
        sessions.start_cleanup_task(self.lifecycle.cancellation_token());

        crate::observability::spawn_sidecar_probe(
            &self.config,
            self.lifecycle.cancellation_token(),
        );

        let passwords = Arc::new(match &self.config.auth.pepper_file {
            Some(path) => PasswordHasher::from_pepper_file(path)?,
            None => {
                tracing::warn!(
                    "auth.pepper_file not configured; using an ephemeral pepper \
                     (stored password hashes will not survive a restart)"
                );
                let mut pepper = vec![0u8; 32];
                use rand::RngCore;
                rand::rngs::OsRng.fill_bytes(&mut pepper);
                PasswordHasher::new(pepper)
            }
        });

        let state = AppState::new(
            self.config.clone(),
            self.repo.clone(),
            barrier,
            sessions.clone(),
            values,
            passwords,
        );
        self.state = Some(state.clone());

        // Public router: template routes plus the domain's contributions,
        // each surface behind its own chain.
        let public_app = self.assemble_public_router(state, sessions)?;
        let public_tcp = TcpListener::bind(SocketAddr::new(
            self.config.public.address,
            self.config.public.port,
        ))
        .await?;
        let public_addr = public_tcp.local_addr()?;
        self.public_addr = Some(public_addr);
        let public_listener = TlsListener::new(public_tcp, tls);
        let drain = self.lifecycle.drain.clone();
        self.serve_handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(
                public_listener,
                public_app.into_make_service_with_connect_info::<RemoteAddr>(),
            )
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .await
            {
                tracing::error!("public listener failed: {e}");
            }
        }));
        tracing::info!(addr = %public_addr, "public listener open");

        self.lifecycle.advance(LifecycleState::Ready);
        Ok(())
    }

    fn assemble_public_router(
        &mut self,
        state: AppState,
        sessions: Arc<SessionManager>,
    ) -> Result<Router> {
        let mut routes = PublicRoutes::default();
        if let Some(register) = self.public_routes.take() {
            routes = register(routes);
        }

        // Browser chain: CSRF + session middleware, then CORS/CSP headers.
        // route_layer refuses empty routers, hence the guards.
        let mut browser = routes.browser;
        if browser.has_routes() {
            browser = browser.route_layer(axum::middleware::from_fn_with_state(
                sessions.clone(),
                browser_session_middleware,
            ));
        }
        let browser = apply_browser_headers(browser, &self.config.cors, &self.config.csp);

        // Service chain: allow-list, rate limits, session middleware.
        let service_state = ServiceChainState {
            manager: sessions.clone(),
            limiter: Arc::new(RateLimit::new(&self.config.ratelimit)?),
            allowlist: Arc::new(IpAllowlist::from_config(&self.config.ip_allowlist)?),
        };
        let mut service = routes.service;
        if service.has_routes() {
            service = service.route_layer(axum::middleware::from_fn_with_state(
                service_state,
                service_session_middleware,
            ));
        }

        let app = Router::new()
            .nest("/browser/api/v1", browser)
            .nest("/service/api/v1", service)
            .merge(crate::handlers::auth_router())
            .with_state(state);

        // Shared outer layers: tracing, deadline, body limit, request ids,
        // panic recovery.
        let app = app
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                self.config.request_timeout(),
            ))
            .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(SetSensitiveRequestHeadersLayer::new([
                http::header::AUTHORIZATION,
                http::header::COOKIE,
            ]))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(CatchPanicLayer::new());

        Ok(app)
    }

    /// Trigger and complete a shutdown. Idempotent: later calls are no-ops.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.lifecycle.begin_drain();
        self.finish_shutdown().await
    }

    /// Serve until a shutdown is requested (admin endpoint, signal, or
    /// [`shutdown`](Self::shutdown) from another task), then drain.
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        let lifecycle = self.lifecycle.clone();
        tokio::select! {
            _ = lifecycle.drain_requested() => {}
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                lifecycle.begin_drain();
            }
        }
        self.finish_shutdown().await
    }

    async fn finish_shutdown(&mut self) -> Result<()> {
        if self.lifecycle.state() == LifecycleState::Stopped {
            return Ok(());
        }

        let grace = self.config.drain_grace();
        tracing::info!(grace_secs = grace.as_secs(), "draining in-flight requests");
        let mut handles: Vec<JoinHandle<()>> = self.serve_handles.drain(..).collect();
        let drained = tokio::time::timeout(grace, async {
            for handle in &mut handles {
                let _ = handle.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("drain grace expired with requests still in flight");
            for handle in &handles {
                handle.abort();
            }
        }

        self.lifecycle.advance(LifecycleState::Stopped);
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_moves_forward_only() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::New);

        lifecycle.advance(LifecycleState::Starting);
        lifecycle.advance(LifecycleState::Ready);
        assert_eq!(lifecycle.state(), LifecycleState::Ready);

        // Backwards transitions are ignored.
        lifecycle.advance(LifecycleState::Starting);
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
    }

    #[test]
    fn begin_drain_is_idempotent_and_cancels_workers() {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Starting);
        lifecycle.advance(LifecycleState::Ready);

        lifecycle.begin_drain();
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
        assert!(lifecycle.cancellation_token().is_cancelled());

        lifecycle.begin_drain();
        assert_eq!(lifecycle.state(), LifecycleState::Draining);
    }
}
