//! CSRF token minting and validation
//!
//! Tokens are HMAC-SHA384 over the session's `jti` under a per-process key,
//! handed to the browser alongside the session token at issuance. Non-GET
//! browser requests present the value in `X-CSRF-Token`; validation recomputes
//! the MAC for the authenticated session and compares in constant time. No
//! server-side CSRF state is stored, so there is nothing to clean up.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha384;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypto::jwk::{b64, ub64};

/// Header carrying the CSRF token on non-safe browser requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Per-process CSRF protection key.
#[derive(Clone)]
pub struct CsrfProtect {
    key: Zeroizing<Vec<u8>>,
}

impl Default for CsrfProtect {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrfProtect {
    /// Create with a fresh random key. Tokens do not survive a process
    /// restart; browsers pick up a new one at next session issuance.
    pub fn new() -> Self {
        let mut key = Zeroizing::new(vec![0u8; 32]);
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Mint the CSRF token for a session jti.
    pub fn mint(&self, jti: &str) -> String {
        let mut mac = Hmac::<Sha384>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(jti.as_bytes());
        b64(&mac.finalize().into_bytes())
    }

    /// Verify a presented token against the session jti in constant time.
    pub fn verify(&self, jti: &str, presented: &str) -> bool {
        let Ok(presented_bytes) = ub64(presented) else {
            return false;
        };
        let mut mac = Hmac::<Sha384>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(jti.as_bytes());
        let expected = mac.finalize().into_bytes();
        expected.ct_eq(&presented_bytes).unwrap_u8() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_verifies_for_its_session() {
        let csrf = CsrfProtect::new();
        let token = csrf.mint("jti-1");
        assert!(csrf.verify("jti-1", &token));
    }

    #[test]
    fn token_is_bound_to_the_jti() {
        let csrf = CsrfProtect::new();
        let token = csrf.mint("jti-1");
        assert!(!csrf.verify("jti-2", &token));
    }

    #[test]
    fn tokens_from_another_process_key_fail() {
        let a = CsrfProtect::new();
        let b = CsrfProtect::new();
        let token = a.mint("jti-1");
        assert!(!b.verify("jti-1", &token));
    }

    #[test]
    fn garbage_tokens_fail_quietly() {
        let csrf = CsrfProtect::new();
        assert!(!csrf.verify("jti-1", "@@not-base64@@"));
        assert!(!csrf.verify("jti-1", ""));
    }
}
