//! Unseal bootstrap
//!
//! Reconstitutes the shared-secret key from M-of-N share files mounted as
//! platform secrets: each share is stretched independently through
//! PBKDF2-HMAC-SHA384 with a deterministic host-identity salt, and the M
//! lowest-indexed stretched shares are folded together. The result unwraps
//! the active root-key row; nothing about the shares or the shared secret is
//! ever persisted.

use std::path::PathBuf;
use zeroize::Zeroizing;

use crate::config::UnsealConfig;
use crate::crypto::kdf;
use crate::error::{BarrierError, Error, Result};

/// Derived shared-secret key length (A256GCM).
pub const SHARED_SECRET_LEN: usize = 32;

/// Kid recorded in root-key JWE headers: roots are wrapped by the unseal
/// shared secret, not by a stored key.
pub const SHARED_SECRET_KID: &str = "unseal-shared-secret";

/// Load the share files and derive the shared-secret key.
pub fn derive_shared_secret(
    config: &UnsealConfig,
    service_name: &str,
) -> Result<Zeroizing<[u8; SHARED_SECRET_LEN]>> {
    if config.share_files.len() < config.shares_required {
        return Err(Error::Config(format!(
            "unseal requires {} shares but only {} share files are configured",
            config.shares_required,
            config.share_files.len()
        )));
    }

    let shares = read_shares(&config.share_files, config.shares_required)?;
    let salt = kdf::deterministic_salt(service_name);

    let mut combined = Zeroizing::new([0u8; SHARED_SECRET_LEN]);
    for share in &shares {
        let stretched = kdf::pbkdf2_sha384(share, &salt, kdf::MIN_ITERATIONS)?;
        for (acc, byte) in combined.iter_mut().zip(stretched.iter()) {
            *acc ^= byte;
        }
    }
    Ok(combined)
}

/// Read the first M share files; an unreadable or empty share aborts.
fn read_shares(paths: &[PathBuf], required: usize) -> Result<Vec<Zeroizing<Vec<u8>>>> {
    let mut shares = Vec::with_capacity(required);
    for path in paths.iter().take(required) {
        let bytes = std::fs::read(path).map_err(|e| {
            tracing::error!(path = %path.display(), "unseal share unreadable: {e}");
            Error::Barrier(BarrierError::UnsealShareInvalid)
        })?;
        if bytes.is_empty() {
            tracing::error!(path = %path.display(), "unseal share file is empty");
            return Err(Error::Barrier(BarrierError::UnsealShareInvalid));
        }
        shares.push(Zeroizing::new(bytes));
    }
    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_shares(dir: &TempDir, count: usize, seed: u8) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("share-{i}"));
                let mut file = std::fs::File::create(&path).unwrap();
                file.write_all(&[seed + i as u8; 32]).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn same_shares_reproduce_the_same_secret() {
        let dir = TempDir::new().unwrap();
        let config = UnsealConfig {
            shares_required: 3,
            share_files: write_shares(&dir, 5, 1),
        };
        let a = derive_shared_secret(&config, "svc").unwrap();
        let b = derive_shared_secret(&config, "svc").unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn different_shares_produce_a_different_secret() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let config_a = UnsealConfig {
            shares_required: 3,
            share_files: write_shares(&dir_a, 3, 1),
        };
        let config_b = UnsealConfig {
            shares_required: 3,
            share_files: write_shares(&dir_b, 3, 100),
        };
        assert_ne!(
            *derive_shared_secret(&config_a, "svc").unwrap(),
            *derive_shared_secret(&config_b, "svc").unwrap()
        );
    }

    #[test]
    fn service_identity_is_bound_into_the_salt() {
        let dir = TempDir::new().unwrap();
        let config = UnsealConfig {
            shares_required: 3,
            share_files: write_shares(&dir, 3, 1),
        };
        assert_ne!(
            *derive_shared_secret(&config, "svc-a").unwrap(),
            *derive_shared_secret(&config, "svc-b").unwrap()
        );
    }

    #[test]
    fn missing_share_file_is_an_invalid_share() {
        let dir = TempDir::new().unwrap();
        let mut files = write_shares(&dir, 3, 1);
        files[1] = dir.path().join("nonexistent");
        let config = UnsealConfig {
            shares_required: 3,
            share_files: files,
        };
        assert!(matches!(
            derive_shared_secret(&config, "svc"),
            Err(Error::Barrier(BarrierError::UnsealShareInvalid))
        ));
    }

    #[test]
    fn too_few_files_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let config = UnsealConfig {
            shares_required: 3,
            share_files: write_shares(&dir, 2, 1),
        };
        assert!(matches!(
            derive_shared_secret(&config, "svc"),
            Err(Error::Config(_))
        ));
    }
}
