//! jose-service entry point
//!
//! Loads the configuration document named by the first argument (default
//! `config.toml`), composes the service template with the JOSE domain
//! schema and routes, and serves until shutdown. Exit codes: 0 normal, 1
//! configuration, 2 unseal failure, 3 migration failure, 4 runtime.

use std::process::ExitCode;

use keystone_service::prelude::*;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("jose-service: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_from(&config_path)?;

    let mut app = ServiceBuilder::new()
        .with_config(config)
        .with_domain_migrations(jose_service::domain_migrations())
        .with_public_routes(jose_service::register_routes)
        .build()
        .await?;

    app.start().await?;
    info!(
        public_port = ?app.public_port(),
        admin_port = ?app.admin_port(),
        "jose-service ready"
    );
    app.run_until_shutdown().await
}
