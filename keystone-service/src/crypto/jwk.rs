//! Key material and JWK construction
//!
//! [`KeyMaterial`] is the in-memory form of a key; [`Jwk`] is its JOSE wire
//! form. Private JWKs only ever leave memory wrapped by the barrier; the
//! public form is what key-issuance endpoints hand out.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey as Ed25519SigningKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::registry::{AlgorithmEntry, EcCurve, KeyParams};
use crate::error::CryptoError;

/// JOSE `use` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyUse {
    /// Signing / verification
    #[serde(rename = "sig")]
    Signature,
    /// Encryption / decryption
    #[serde(rename = "enc")]
    Encryption,
}

/// Decoded private key material
pub enum KeyMaterial {
    Rsa(Box<RsaPrivateKey>),
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    P521(p521::SecretKey),
    Ed25519(Box<Ed25519SigningKey>),
    Oct(Zeroizing<Vec<u8>>),
}

impl KeyMaterial {
    /// Generate fresh key material for a registry entry.
    ///
    /// All randomness comes from the operating system RNG.
    pub fn generate(entry: &AlgorithmEntry) -> Result<Self, CryptoError> {
        match entry.key {
            KeyParams::Rsa { bits } => {
                let key = RsaPrivateKey::new(&mut OsRng, bits)
                    .map_err(|e| CryptoError::Key(format!("RSA keygen failed: {e}")))?;
                Ok(Self::Rsa(Box::new(key)))
            }
            KeyParams::Ec { curve } => Ok(match curve {
                EcCurve::P256 => Self::P256(p256::SecretKey::random(&mut OsRng)),
                EcCurve::P384 => Self::P384(p384::SecretKey::random(&mut OsRng)),
                EcCurve::P521 => Self::P521(p521::SecretKey::random(&mut OsRng)),
            }),
            KeyParams::Ed25519 => Ok(Self::Ed25519(Box::new(Ed25519SigningKey::generate(
                &mut OsRng,
            )))),
            KeyParams::Oct { len } => {
                let mut bytes = Zeroizing::new(vec![0u8; len]);
                OsRng.fill_bytes(&mut bytes);
                Ok(Self::Oct(bytes))
            }
        }
    }

    /// Build the private JWK for this material.
    ///
    /// The kid is freshly assigned (UUID v4).
    pub fn to_jwk(&self, entry: &AlgorithmEntry, key_use: KeyUse) -> Result<Jwk, CryptoError> {
        self.to_jwk_with_kid(entry, key_use, Uuid::new_v4().to_string())
    }

    /// Build the private JWK with an explicit kid.
    pub fn to_jwk_with_kid(
        &self,
        entry: &AlgorithmEntry,
        key_use: KeyUse,
        kid: String,
    ) -> Result<Jwk, CryptoError> {
        let mut jwk = Jwk {
            kid,
            alg: entry.name.to_string(),
            key_use,
            kty: String::new(),
            crv: None,
            x: None,
            y: None,
            d: None,
            n: None,
            e: None,
            p: None,
            q: None,
            k: None,
        };

        match self {
            Self::Rsa(key) => {
                let primes = key.primes();
                jwk.kty = "RSA".into();
                jwk.n = Some(b64(&key.n().to_bytes_be()));
                jwk.e = Some(b64(&key.e().to_bytes_be()));
                jwk.d = Some(b64(&key.d().to_bytes_be()));
                if primes.len() >= 2 {
                    jwk.p = Some(b64(&primes[0].to_bytes_be()));
                    jwk.q = Some(b64(&primes[1].to_bytes_be()));
                }
            }
            Self::P256(key) => {
                let point = key.public_key().to_encoded_point(false);
                jwk.kty = "EC".into();
                jwk.crv = Some("P-256".into());
                jwk.x = Some(b64(point.x().ok_or_else(bad_point)?));
                jwk.y = Some(b64(point.y().ok_or_else(bad_point)?));
                jwk.d = Some(b64(&key.to_bytes()));
            }
            Self::P384(key) => {
                let point = key.public_key().to_encoded_point(false);
                jwk.kty = "EC".into();
                jwk.crv = Some("P-384".into());
                jwk.x = Some(b64(point.x().ok_or_else(bad_point)?));
                jwk.y = Some(b64(point.y().ok_or_else(bad_point)?));
                jwk.d = Some(b64(&key.to_bytes()));
            }
            Self::P521(key) => {
                let point = key.public_key().to_encoded_point(false);
                jwk.kty = "EC".into();
                jwk.crv = Some("P-521".into());
                jwk.x = Some(b64(point.x().ok_or_else(bad_point)?));
                jwk.y = Some(b64(point.y().ok_or_else(bad_point)?));
                jwk.d = Some(b64(&key.to_bytes()));
            }
            Self::Ed25519(key) => {
                jwk.kty = "OKP".into();
                jwk.crv = Some("Ed25519".into());
                jwk.x = Some(b64(key.verifying_key().as_bytes()));
                jwk.d = Some(b64(key.as_bytes()));
            }
            Self::Oct(bytes) => {
                jwk.kty = "oct".into();
                jwk.k = Some(b64(bytes));
            }
        }

        Ok(jwk)
    }
}

fn bad_point() -> CryptoError {
    CryptoError::Key("EC public key is the point at infinity".into())
}

/// JSON Web Key (RFC 7517)
///
/// Serialization skips absent parameters, so the same struct covers RSA, EC,
/// OKP, and oct keys, private or public.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key id
    pub kid: String,

    /// Algorithm this key is bound to
    pub alg: String,

    /// `sig` or `enc`
    #[serde(rename = "use")]
    pub key_use: KeyUse,

    /// Key type: RSA, EC, OKP, oct
    pub kty: String,

    /// Curve (EC / OKP)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC x coordinate / OKP public key (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    /// Private exponent / scalar / seed (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,

    /// RSA modulus (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA public exponent (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// RSA first prime factor (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,

    /// RSA second prime factor (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,

    /// Symmetric key bytes (base64url)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<String>,
}

impl Jwk {
    /// The public half of this JWK (private parameters stripped).
    ///
    /// Symmetric keys have no public half; the result keeps only metadata.
    pub fn public_jwk(&self) -> Jwk {
        let mut public = self.clone();
        public.d = None;
        public.k = None;
        public
    }

    /// True if the private parameters are present.
    pub fn is_private(&self) -> bool {
        self.d.is_some() || self.k.is_some()
    }

    /// Symmetric key bytes, if this is an oct key.
    pub fn symmetric_key(&self) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let k = self
            .k
            .as_deref()
            .ok_or_else(|| CryptoError::Key(format!("JWK {} has no symmetric key", self.kid)))?;
        Ok(Zeroizing::new(ub64(k)?))
    }

    /// Reconstruct private key material from this JWK.
    pub fn key_material(&self) -> Result<KeyMaterial, CryptoError> {
        match self.kty.as_str() {
            "RSA" => {
                let n = BigUint::from_bytes_be(&ub64(self.n.as_deref().ok_or_else(|| {
                    missing(self, "n")
                })?)?);
                let e = BigUint::from_bytes_be(&ub64(self.e.as_deref().ok_or_else(|| {
                    missing(self, "e")
                })?)?);
                let d = BigUint::from_bytes_be(&ub64(self.d.as_deref().ok_or_else(|| {
                    missing(self, "d")
                })?)?);
                let mut primes = Vec::new();
                if let (Some(p), Some(q)) = (self.p.as_deref(), self.q.as_deref()) {
                    primes.push(BigUint::from_bytes_be(&ub64(p)?));
                    primes.push(BigUint::from_bytes_be(&ub64(q)?));
                }
                let key = RsaPrivateKey::from_components(n, e, d, primes)
                    .map_err(|err| CryptoError::Key(format!("RSA JWK invalid: {err}")))?;
                Ok(KeyMaterial::Rsa(Box::new(key)))
            }
            "EC" => {
                let d = ub64(self.d.as_deref().ok_or_else(|| missing(self, "d"))?)?;
                match self.crv.as_deref() {
                    Some("P-256") => p256::SecretKey::from_slice(&d)
                        .map(KeyMaterial::P256)
                        .map_err(|e| CryptoError::Key(format!("P-256 JWK invalid: {e}"))),
                    Some("P-384") => p384::SecretKey::from_slice(&d)
                        .map(KeyMaterial::P384)
                        .map_err(|e| CryptoError::Key(format!("P-384 JWK invalid: {e}"))),
                    Some("P-521") => p521::SecretKey::from_slice(&d)
                        .map(KeyMaterial::P521)
                        .map_err(|e| CryptoError::Key(format!("P-521 JWK invalid: {e}"))),
                    other => Err(CryptoError::Key(format!(
                        "unsupported EC curve {other:?} on JWK {}",
                        self.kid
                    ))),
                }
            }
            "OKP" => {
                let d = ub64(self.d.as_deref().ok_or_else(|| missing(self, "d"))?)?;
                let seed: [u8; 32] = d
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::Key("Ed25519 seed must be 32 bytes".into()))?;
                Ok(KeyMaterial::Ed25519(Box::new(Ed25519SigningKey::from_bytes(
                    &seed,
                ))))
            }
            "oct" => Ok(KeyMaterial::Oct(self.symmetric_key()?)),
            other => Err(CryptoError::Key(format!(
                "unsupported kty {other} on JWK {}",
                self.kid
            ))),
        }
    }

    /// Serialize to the JSON string stored (wrapped) in the repository.
    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|e| CryptoError::Key(format!("JWK encode: {e}")))
    }

    /// Parse from the stored JSON form.
    pub fn from_json(json: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(json)
            .map_err(|e| CryptoError::BadCiphertext(format!("JWK decode: {e}")))
    }
}

fn missing(jwk: &Jwk, param: &str) -> CryptoError {
    CryptoError::Key(format!("JWK {} is missing parameter {param}", jwk.kid))
}

/// base64url-encode without padding
pub(crate) fn b64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url-decode without padding
pub(crate) fn ub64(s: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| CryptoError::BadCiphertext(format!("base64url decode: {e}")))
}
