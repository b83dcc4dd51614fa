//! Configuration management using Figment
//!
//! Configuration is loaded from a single declarative TOML document, with
//! environment overrides (prefix: `KEYSTONE_`) layered on top of defaults.
//! Secrets (unseal shares, database DSN, password pepper) are never read from
//! the environment; the document carries *paths* to platform-mounted secret
//! files and the contents are loaded at startup.
//!
//! Every `Config` is a per-instance value constructed by the service builder.
//! There is no process-global configuration state.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Service identity
    pub service: ServiceConfig,

    /// Public (business) listener
    #[serde(default)]
    pub public: ListenerConfig,

    /// Admin (health/shutdown) listener
    #[serde(default)]
    pub admin: ListenerConfig,

    /// TLS configuration shared by both listeners
    #[serde(default)]
    pub tls: TlsConfig,

    /// Barrier configuration (unseal + rotation)
    #[serde(default)]
    pub barrier: BarrierConfig,

    /// Session token configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Service-path rate limiting
    #[serde(default)]
    pub ratelimit: RateLimitConfig,

    /// Browser-path CORS policy
    #[serde(default)]
    pub cors: CorsConfig,

    /// Browser-path content security policy
    #[serde(default)]
    pub csp: CspConfig,

    /// Service-path IP allow-list
    #[serde(default)]
    pub ip_allowlist: IpAllowlistConfig,

    /// Password hashing inputs
    #[serde(default)]
    pub auth: AuthConfig,

    /// Telemetry (optional; absence disables export)
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}

/// Password hashing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Platform-mounted secret file holding the deployment pepper.
    ///
    /// Absent in development: an ephemeral random pepper is generated and
    /// stored hashes do not survive a restart.
    #[serde(default)]
    pub pepper_file: Option<PathBuf>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name (used as token issuer and telemetry resource)
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Per-request deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Grace period for draining in-flight requests on shutdown
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
            drain_grace_secs: default_drain_grace(),
        }
    }
}

/// Bind address for one listener; port 0 requests an ephemeral port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address
    #[serde(default = "default_address")]
    pub address: IpAddr,

    /// Bind port (0 = ephemeral)
    #[serde(default)]
    pub port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
        }
    }
}

/// TLS operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Certificate and key loaded from files
    Static,
    /// CA loaded from files, leaf generated at startup
    Mixed,
    /// Self-signed ephemeral certificate (development)
    Auto,
    /// Leaf signed by an upstream KMS-reachable CA
    UpstreamCa,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Operating mode
    #[serde(default = "default_tls_mode")]
    pub mode: TlsMode,

    /// Static/mixed: PEM certificate chain
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// Static/mixed: PEM private key
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Mixed/upstream: PEM CA certificate (+ key for mixed)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Mixed: PEM CA private key
    #[serde(default)]
    pub ca_key_file: Option<PathBuf>,

    /// SANs for generated leaf certificates
    #[serde(default = "default_dns_sans")]
    pub dns_sans: Vec<String>,

    /// IP SANs for generated leaf certificates
    #[serde(default)]
    pub ip_sans: Vec<IpAddr>,

    /// Generated leaf validity in days
    #[serde(default = "default_cert_validity_days")]
    pub validity_days: u32,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            mode: default_tls_mode(),
            cert_file: None,
            key_file: None,
            ca_file: None,
            ca_key_file: None,
            dns_sans: default_dns_sans(),
            ip_sans: Vec::new(),
            validity_days: default_cert_validity_days(),
        }
    }
}

/// Barrier configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BarrierConfig {
    /// Unseal secret configuration
    #[serde(default)]
    pub unseal: UnsealConfig,

    /// Optional per-level rotation TTLs
    #[serde(default)]
    pub rotation: RotationConfig,
}

/// M-of-N unseal share configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealConfig {
    /// Shares required to reconstruct the shared-secret key (M)
    #[serde(default = "default_shares_required")]
    pub shares_required: usize,

    /// Paths to the N share files (platform-mounted secrets)
    #[serde(default)]
    pub share_files: Vec<PathBuf>,
}

impl Default for UnsealConfig {
    fn default() -> Self {
        Self {
            shares_required: default_shares_required(),
            share_files: Vec::new(),
        }
    }
}

/// Periodic rotation TTLs; a level with no TTL rotates only on demand
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RotationConfig {
    /// Root key rotation interval in seconds
    #[serde(default)]
    pub root_ttl_secs: Option<u64>,

    /// Intermediate key rotation interval in seconds
    #[serde(default)]
    pub intermediate_ttl_secs: Option<u64>,

    /// Content key rotation interval in seconds
    #[serde(default)]
    pub content_ttl_secs: Option<u64>,
}

/// Session token form
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionForm {
    /// Signed tokens (compact JWS)
    Jws,
    /// Encrypted tokens (compact JWE)
    Jwe,
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default token form; realms may override
    #[serde(default = "default_session_form")]
    pub form: SessionForm,

    /// Signing algorithm for JWS sessions (must be a registry entry)
    #[serde(default = "default_session_algorithm")]
    pub signing_algorithm: String,

    /// Token lifetime in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Interval between cleanup sweeps in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Expected audience; defaults to the service name when empty
    #[serde(default)]
    pub audience: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            form: default_session_form(),
            signing_algorithm: default_session_algorithm(),
            ttl_secs: default_session_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
            audience: None,
        }
    }
}

impl SessionConfig {
    /// Token lifetime as a [`Duration`]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Cleanup interval as a [`Duration`]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Persistence engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// File-backed SQLite (WAL, busy timeout)
    Embedded,
    /// Networked PostgreSQL
    Networked,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Engine selection
    #[serde(default = "default_database_driver")]
    pub driver: DatabaseDriver,

    /// Embedded: database file path (`:memory:` for tests)
    #[serde(default = "default_embedded_path")]
    pub path: PathBuf,

    /// Networked: secret file containing the DSN
    #[serde(default)]
    pub dsn_file: Option<PathBuf>,

    /// Maximum pool connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Embedded engine busy timeout in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: default_database_driver(),
            path: default_embedded_path(),
            dsn_file: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Service-path token-bucket rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained requests per second, per tenant and per remote address
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    /// Burst allowance on top of the sustained rate
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
        }
    }
}

/// Browser-path CORS policy: explicit origins only, no wildcards
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    /// Allowed origins (exact match)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Browser-path Content-Security-Policy headers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CspConfig {
    /// default-src directive
    #[serde(default = "default_csp_self")]
    pub default_src: String,

    /// frame-ancestors directive
    #[serde(default = "default_csp_none")]
    pub frame_ancestors: String,

    /// Send X-Content-Type-Options: nosniff
    #[serde(default = "default_true")]
    pub nosniff: bool,
}

impl Default for CspConfig {
    fn default() -> Self {
        Self {
            default_src: default_csp_self(),
            frame_ancestors: default_csp_none(),
            nosniff: default_true(),
        }
    }
}

impl CspConfig {
    /// Render the Content-Security-Policy header value
    pub fn header_value(&self) -> String {
        format!(
            "default-src {}; frame-ancestors {}",
            self.default_src, self.frame_ancestors
        )
    }
}

/// Service-path IP allow-list (exact addresses and `a.b.c.d/n` prefixes)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IpAllowlistConfig {
    /// Allowed entries; empty list allows every address
    #[serde(default)]
    pub entries: Vec<String>,
}

/// Telemetry export protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryProtocol {
    Grpc,
    Http,
    Grpcs,
    Https,
    /// Log spans to stdout instead of exporting
    Console,
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint
    pub otlp_endpoint: String,

    /// Export protocol
    #[serde(default = "default_telemetry_protocol")]
    pub protocol: TelemetryProtocol,

    /// Sidecar health probe URL (optional)
    #[serde(default)]
    pub sidecar_health_url: Option<String>,

    /// Attempts before continuing without telemetry
    #[serde(default = "default_telemetry_attempts")]
    pub max_attempts: u32,
}

impl Config {
    /// Load configuration from an explicit TOML file plus `KEYSTONE_` env
    /// overrides, layered over defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KEYSTONE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        match self.tls.mode {
            TlsMode::Static => {
                if self.tls.cert_file.is_none() || self.tls.key_file.is_none() {
                    return Err(Error::Config(
                        "tls.mode=static requires tls.cert_file and tls.key_file".into(),
                    ));
                }
            }
            TlsMode::Mixed => {
                if self.tls.ca_file.is_none() || self.tls.ca_key_file.is_none() {
                    return Err(Error::Config(
                        "tls.mode=mixed requires tls.ca_file and tls.ca_key_file".into(),
                    ));
                }
            }
            TlsMode::UpstreamCa => {
                if self.tls.ca_file.is_none() || self.tls.ca_key_file.is_none() {
                    return Err(Error::Config(
                        "tls.mode=upstream_ca requires the upstream-issued \
                         tls.ca_file and tls.ca_key_file to be mounted"
                            .into(),
                    ));
                }
            }
            TlsMode::Auto => {}
        }

        if self.barrier.unseal.shares_required == 0 {
            return Err(Error::Config(
                "barrier.unseal.shares_required must be at least 1".into(),
            ));
        }
        if !self.barrier.unseal.share_files.is_empty()
            && self.barrier.unseal.share_files.len() < self.barrier.unseal.shares_required
        {
            return Err(Error::Config(format!(
                "barrier.unseal requires {} shares but only {} share files are configured",
                self.barrier.unseal.shares_required,
                self.barrier.unseal.share_files.len()
            )));
        }

        // The signing algorithm must exist in the registry and be a signing
        // algorithm; fail closed at startup rather than at first issuance.
        let entry = crate::crypto::registry::lookup(&self.session.signing_algorithm)
            .map_err(|e| Error::Config(e.to_string()))?;
        if !entry.is_signing() {
            return Err(Error::Config(format!(
                "session.signing_algorithm {} is not a signing algorithm",
                self.session.signing_algorithm
            )));
        }

        if self.database.driver == DatabaseDriver::Networked && self.database.dsn_file.is_none() {
            return Err(Error::Config(
                "database.driver=networked requires database.dsn_file".into(),
            ));
        }

        if self.ratelimit.requests_per_second == 0 {
            return Err(Error::Config(
                "ratelimit.requests_per_second must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Token audience: explicit override or the service name
    pub fn session_audience(&self) -> &str {
        self.session
            .audience
            .as_deref()
            .unwrap_or(&self.service.name)
    }

    /// Per-request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs)
    }

    /// Shutdown drain window
    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.service.drain_grace_secs)
    }
}

// Default value functions

fn default_service_name() -> String {
    "keystone".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_drain_grace() -> u64 {
    10
}

fn default_address() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_tls_mode() -> TlsMode {
    TlsMode::Auto
}

fn default_dns_sans() -> Vec<String> {
    vec!["localhost".to_string()]
}

fn default_cert_validity_days() -> u32 {
    90
}

fn default_shares_required() -> usize {
    3
}

fn default_session_form() -> SessionForm {
    SessionForm::Jws
}

fn default_session_algorithm() -> String {
    "ES256".to_string()
}

fn default_session_ttl() -> u64 {
    900
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_database_driver() -> DatabaseDriver {
    DatabaseDriver::Embedded
}

fn default_embedded_path() -> PathBuf {
    PathBuf::from("keystone.db")
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_requests_per_second() -> u32 {
    50
}

fn default_burst() -> u32 {
    25
}

fn default_csp_self() -> String {
    "'self'".to_string()
}

fn default_csp_none() -> String {
    "'none'".to_string()
}

fn default_true() -> bool {
    true
}

fn default_telemetry_protocol() -> TelemetryProtocol {
    TelemetryProtocol::Grpc
}

fn default_telemetry_attempts() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        config.validate().expect("default config should validate");
        assert_eq!(config.session.signing_algorithm, "ES256");
        assert_eq!(config.public.port, 0);
    }

    #[test]
    fn static_tls_requires_files() {
        let mut config = Config::default();
        config.tls.mode = TlsMode::Static;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn networked_driver_requires_dsn_file() {
        let mut config = Config::default();
        config.database.driver = DatabaseDriver::Networked;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_signing_algorithm_rejected() {
        let mut config = Config::default();
        config.session.signing_algorithm = "none".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn encryption_algorithm_rejected_for_signing() {
        let mut config = Config::default();
        config.session.signing_algorithm = "A256GCM".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn too_few_share_files_rejected() {
        let mut config = Config::default();
        config.barrier.unseal.shares_required = 3;
        config.barrier.unseal.share_files = vec![PathBuf::from("a"), PathBuf::from("b")];
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[service]
name = "jose-service"

[public]
port = 8443

[session]
form = "jwe"
ttl_secs = 60
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.service.name, "jose-service");
        assert_eq!(config.public.port, 8443);
        assert_eq!(config.session.form, SessionForm::Jwe);
        assert_eq!(config.session.ttl_secs, 60);
    }
}
