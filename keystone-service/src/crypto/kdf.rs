//! Key derivation and password hashing
//!
//! PBKDF2-HMAC-SHA384 everywhere: unseal share stretching and password
//! hashing share the same primitive with different salts and inputs. The
//! password path folds in a deployment-wide pepper loaded from a
//! platform-mounted secret file.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha384};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{CryptoError, Error, Result};

/// Minimum PBKDF2 iteration count accepted anywhere in the suite.
pub const MIN_ITERATIONS: u32 = 600_000;

/// Derived key length in bytes.
pub const DERIVED_KEY_LEN: usize = 32;

/// Minimum salt length in bytes.
pub const MIN_SALT_LEN: usize = 16;

/// Stretch an input through PBKDF2-HMAC-SHA384.
pub fn pbkdf2_sha384(
    input: &[u8],
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
    if iterations < MIN_ITERATIONS {
        return Err(CryptoError::Key(format!(
            "PBKDF2 iteration count {iterations} is below the floor of {MIN_ITERATIONS}"
        ))
        .into());
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::Key(format!(
            "PBKDF2 salt must be at least {MIN_SALT_LEN} bytes"
        ))
        .into());
    }
    let mut out = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    pbkdf2_hmac::<Sha384>(input, salt, iterations, &mut out[..]);
    Ok(out)
}

/// HKDF-SHA384 expand over already-uniform key material.
pub fn hkdf_sha384_expand(
    ikm: &[u8],
    info: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha384>::new(None, ikm);
    let mut okm = Zeroizing::new(vec![0u8; len]);
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::Key(format!("HKDF output length {len} too large")))?;
    Ok(okm)
}

/// Deterministic PBKDF2 salt from fixed host-identity inputs.
///
/// The same service name always yields the same salt, so a restart with the
/// same unseal shares reproduces the same shared-secret key.
pub fn deterministic_salt(service_name: &str) -> [u8; 48] {
    let mut hasher = Sha384::new();
    hasher.update(b"keystone/unseal/v1");
    hasher.update([0u8]);
    hasher.update(service_name.as_bytes());
    hasher.finalize().into()
}

/// Password hasher: PBKDF2-HMAC-SHA384 over password ‖ pepper.
///
/// Hashes serialize to `pbkdf2-sha384$<iterations>$<salt>$<dk>` with
/// base64url fields, so parameters can be raised without invalidating stored
/// hashes.
#[derive(Clone)]
pub struct PasswordHasher {
    pepper: Zeroizing<Vec<u8>>,
    iterations: u32,
}

impl PasswordHasher {
    /// Create a hasher with the given pepper bytes.
    pub fn new(pepper: Vec<u8>) -> Self {
        Self {
            pepper: Zeroizing::new(pepper),
            iterations: MIN_ITERATIONS,
        }
    }

    /// Load the pepper from a platform-mounted secret file.
    pub fn from_pepper_file(path: &std::path::Path) -> Result<Self> {
        let pepper = std::fs::read(path).map_err(|e| {
            Error::Config(format!(
                "failed to read pepper file '{}': {e}",
                path.display()
            ))
        })?;
        if pepper.is_empty() {
            return Err(Error::Config(format!(
                "pepper file '{}' is empty",
                path.display()
            )));
        }
        Ok(Self::new(pepper))
    }

    /// Hash a password with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String> {
        let mut salt = [0u8; MIN_SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let dk = self.derive(password, &salt, self.iterations)?;
        Ok(format!(
            "pbkdf2-sha384${}${}${}",
            self.iterations,
            super::jwk::b64(&salt),
            super::jwk::b64(&dk[..])
        ))
    }

    /// Verify a password against a stored hash in constant time.
    pub fn verify(&self, password: &str, stored: &str) -> Result<bool> {
        let mut parts = stored.split('$');
        let (scheme, iterations, salt, dk) = match (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) {
            (Some(s), Some(i), Some(salt), Some(dk)) if parts.next().is_none() => {
                (s, i, salt, dk)
            }
            _ => {
                return Err(CryptoError::Key("password hash format invalid".into()).into());
            }
        };
        if scheme != "pbkdf2-sha384" {
            return Err(CryptoError::Key(format!(
                "unsupported password hash scheme {scheme}"
            ))
            .into());
        }
        let iterations: u32 = iterations
            .parse()
            .map_err(|_| CryptoError::Key("password hash iteration count invalid".into()))?;
        let salt = super::jwk::ub64(salt)?;
        let expected = super::jwk::ub64(dk)?;

        let actual = self.derive(password, &salt, iterations)?;
        Ok(actual[..].ct_eq(&expected[..]).unwrap_u8() == 1)
    }

    fn derive(
        &self,
        password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Zeroizing<[u8; DERIVED_KEY_LEN]>> {
        let mut input = Zeroizing::new(Vec::with_capacity(
            password.len() + self.pepper.len(),
        ));
        input.extend_from_slice(password.as_bytes());
        input.extend_from_slice(&self.pepper);
        pbkdf2_sha384(&input, salt, iterations)
    }
}
