//! Shared fixtures for integration tests
//!
//! Each fixture gets its own temp directory holding the embedded database
//! file and the unseal share files, ephemeral ports on both listeners, and
//! self-signed TLS. Handler-level behavior is unit-tested in-memory inside
//! the crate; these tests exercise real listeners end to end.

use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

use keystone_service::prelude::*;

/// Write N unseal share files with deterministic contents.
pub fn write_shares(dir: &TempDir, count: usize, seed: u8) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.path().join(format!("share-{i}"));
            let mut file = std::fs::File::create(&path).unwrap();
            file.write_all(&[seed.wrapping_add(i as u8); 32]).unwrap();
            path
        })
        .collect()
}

/// A config with ephemeral ports, auto TLS, embedded storage, and 3-of-5
/// unseal shares inside `dir`.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.service.name = "keystone-tests".to_string();
    config.service.drain_grace_secs = 2;
    config.database.path = dir.path().join("keystone.db");
    config.barrier.unseal.shares_required = 3;
    config.barrier.unseal.share_files = write_shares(dir, 5, 11);
    config.session.ttl_secs = 60;
    config
}

/// HTTPS client that tolerates the self-signed test certificate.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .unwrap()
}

/// Register a tenant + user and log in; returns (tenant_id, bearer token,
/// csrf token).
pub async fn register_and_login(
    client: &reqwest::Client,
    public_port: u16,
) -> (String, String, String) {
    let base = format!("https://127.0.0.1:{public_port}");

    let register: serde_json::Value = client
        .post(format!("{base}/auth/register"))
        .json(&serde_json::json!({
            "tenant_name": "integration tenant",
            "username": "alice",
            "password": "correct horse battery staple"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tenant_id = register["tenant_id"].as_str().unwrap().to_string();

    let login: serde_json::Value = client
        .post(format!("{base}/auth/login"))
        .json(&serde_json::json!({
            "tenant_id": tenant_id,
            "username": "alice",
            "password": "correct horse battery staple"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    (
        tenant_id,
        login["token"].as_str().unwrap().to_string(),
        login["csrf_token"].as_str().unwrap().to_string(),
    )
}
