//! Application state shared across handlers

use std::sync::Arc;

use crate::barrier::Barrier;
use crate::config::Config;
use crate::crypto::kdf::PasswordHasher;
use crate::generator::ValuePool;
use crate::repository::Repository;
use crate::session::SessionManager;

/// State handed to every public-surface handler.
///
/// Everything is behind an `Arc`; cloning is cheap and handlers never hold
/// mutable access to another component's internals.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    repo: Arc<Repository>,
    barrier: Arc<Barrier>,
    sessions: Arc<SessionManager>,
    values: Arc<ValuePool>,
    passwords: Arc<PasswordHasher>,
}

impl AppState {
    /// Assemble the state from built components.
    pub fn new(
        config: Arc<Config>,
        repo: Arc<Repository>,
        barrier: Arc<Barrier>,
        sessions: Arc<SessionManager>,
        values: Arc<ValuePool>,
        passwords: Arc<PasswordHasher>,
    ) -> Self {
        Self {
            config,
            repo,
            barrier,
            sessions,
            values,
            passwords,
        }
    }

    /// Service configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Transactional store
    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// The unsealed barrier
    pub fn barrier(&self) -> &Arc<Barrier> {
        &self.barrier
    }

    /// Session manager
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Pre-generated value pool
    pub fn values(&self) -> &Arc<ValuePool> {
        &self.values
    }

    /// Password hasher (PBKDF2 + deployment pepper)
    pub fn passwords(&self) -> &Arc<PasswordHasher> {
        &self.passwords
    }
}
