//! TLS support using rustls
//!
//! Provides a [`TlsListener`] that wraps a TCP listener with TLS
//! termination, implementing [`axum::serve::Listener`] for seamless
//! integration with axum's server, plus construction of the rustls
//! [`ServerConfig`] for each of the four operating modes: `static`, `mixed`,
//! `auto`, and `upstream_ca`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::config::{TlsConfig, TlsMode};
use crate::crypto::certs;
use crate::error::{Error, Result};

/// A TLS-enabled listener wrapping a [`TcpListener`] with a [`TlsAcceptor`].
///
/// Implements [`axum::serve::Listener`] so it can be used as a drop-in
/// replacement for `TcpListener` when calling `axum::serve()`.
pub struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    /// Create a new TLS listener from an existing TCP listener and server config.
    pub fn new(tcp: TcpListener, server_config: Arc<ServerConfig>) -> Self {
        Self {
            tcp,
            acceptor: TlsAcceptor::from(server_config),
        }
    }

    /// The locally bound address (resolves ephemeral ports).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    fn accept(&mut self) -> impl std::future::Future<Output = (Self::Io, Self::Addr)> + Send {
        let acceptor = self.acceptor.clone();
        let tcp = &mut self.tcp;

        async move {
            loop {
                // Accept a TCP connection using the tokio TcpListener method
                // (not the axum Listener trait method, which handles errors
                // internally).
                let (stream, addr) = match TcpListener::accept(tcp).await {
                    Ok((stream, addr)) => (stream, addr),
                    Err(e) => {
                        tracing::error!("TCP accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                // Perform TLS handshake. On failure, log and try the next
                // connection.
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => return (tls_stream, addr),
                    Err(e) => {
                        tracing::warn!("TLS handshake failed from {}: {}", addr, e);
                        continue;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

/// Give handlers behind a [`TlsListener`] access to the remote address via
/// `ConnectInfo<RemoteAddr>`.
///
/// Rust's orphan rules forbid implementing the foreign `Connected` trait for
/// the foreign `SocketAddr` type here (only axum itself may do that, for its
/// own `TcpListener`), so handlers extract this local newtype instead.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAddr(pub SocketAddr);

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, TlsListener>>
    for RemoteAddr
{
    fn connect_info(stream: axum::serve::IncomingStream<'_, TlsListener>) -> Self {
        RemoteAddr(*stream.remote_addr())
    }
}

/// Build the rustls [`ServerConfig`] for the configured TLS mode.
pub fn build_server_config(config: &TlsConfig) -> Result<Arc<ServerConfig>> {
    match config.mode {
        TlsMode::Static => {
            let cert_path = config
                .cert_file
                .as_ref()
                .ok_or_else(|| Error::Config("tls.mode=static requires tls.cert_file".into()))?;
            let key_path = config
                .key_file
                .as_ref()
                .ok_or_else(|| Error::Config("tls.mode=static requires tls.key_file".into()))?;
            let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
                Error::Config(format!(
                    "failed to read TLS cert file '{}': {e}",
                    cert_path.display()
                ))
            })?;
            let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
                Error::Config(format!(
                    "failed to read TLS key file '{}': {e}",
                    key_path.display()
                ))
            })?;
            server_config_from_pem(&cert_pem, &key_pem)
        }
        TlsMode::Auto => {
            tracing::warn!("tls.mode=auto: serving a self-signed ephemeral certificate");
            let issued = certs::self_signed(&config.dns_sans, &config.ip_sans, config.validity_days)?;
            server_config_from_pem(&issued.cert_pem, &issued.key_pem)
        }
        TlsMode::Mixed | TlsMode::UpstreamCa => {
            let ca_path = config
                .ca_file
                .as_ref()
                .ok_or_else(|| Error::Config("CA-backed TLS modes require tls.ca_file".into()))?;
            let ca_key_path = config.ca_key_file.as_ref().ok_or_else(|| {
                Error::Config("CA-backed TLS modes require tls.ca_key_file".into())
            })?;
            let ca_pem = std::fs::read_to_string(ca_path).map_err(|e| {
                Error::Config(format!(
                    "failed to read CA file '{}': {e}",
                    ca_path.display()
                ))
            })?;
            let ca_key_pem = std::fs::read_to_string(ca_key_path).map_err(|e| {
                Error::Config(format!(
                    "failed to read CA key file '{}': {e}",
                    ca_key_path.display()
                ))
            })?;
            if config.mode == TlsMode::UpstreamCa {
                tracing::info!("tls.mode=upstream_ca: issuing leaf under the mounted upstream CA");
            }
            let issued = certs::issue_from_ca(
                &ca_pem,
                &ca_key_pem,
                &config.dns_sans,
                &config.ip_sans,
                config.validity_days,
            )?;
            // Serve the leaf with the CA appended so clients can chase the chain.
            let chain = format!("{}\n{}", issued.cert_pem, ca_pem);
            server_config_from_pem(&chain, &issued.key_pem)
        }
    }
}

/// Build a rustls server config from in-memory PEM text.
fn server_config_from_pem(cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>> {
    use rustls_pemfile::{certs, private_key};
    use tokio_rustls::rustls;

    let mut cert_reader = io::BufReader::new(cert_pem.as_bytes());
    let cert_chain: Vec<rustls::pki_types::CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("failed to parse TLS certificates: {e}")))?;

    if cert_chain.is_empty() {
        return Err(Error::Config("TLS cert input contains no certificates".into()));
    }

    let mut key_reader = io::BufReader::new(key_pem.as_bytes());
    let key = private_key(&mut key_reader)
        .map_err(|e| Error::Config(format!("failed to parse TLS private key: {e}")))?
        .ok_or_else(|| Error::Config("TLS key input contains no private key".into()))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::Config(format!("failed to build TLS server config: {e}")))?;

    Ok(Arc::new(server_config))
}
