//! Compact JWS signing and verification
//!
//! `jsonwebtoken` carries every registry algorithm it supports; ES512 has a
//! native P-521 path producing the same compact form, since the crate has no
//! binding for it. Callers select keys by kid through [`super::KidCache`] or
//! the session manager.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use pkcs8::{EncodePrivateKey, LineEnding};
use p521::ecdsa::signature::{Signer, Verifier};
use p521::ecdsa::{Signature as P521Signature, SigningKey as P521SigningKey, VerifyingKey as P521VerifyingKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::jwk::{b64, ub64, Jwk, KeyMaterial};
use super::registry;
use crate::error::CryptoError;

/// Granular verification failure, mapped by callers onto their own error
/// vocabulary (the session manager maps these to `ErrSession*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Token is past its `exp`
    Expired,
    /// Signature did not verify
    BadSignature,
    /// `aud` claim mismatch
    WrongAudience,
    /// Anything structurally wrong with the token
    Malformed(String),
}

/// Sign a claims object into a compact JWS under the given private JWK.
pub fn sign_claims<T: Serialize>(jwk: &Jwk, claims: &T) -> Result<String, CryptoError> {
    let entry = registry::lookup(&jwk.alg)?;
    if !entry.is_signing() {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "{} is not a signing algorithm",
            jwk.alg
        )));
    }

    match entry.jwt {
        Some(alg) => {
            let mut header = Header::new(alg);
            header.kid = Some(jwk.kid.clone());
            let key = encoding_key(jwk)?;
            encode(&header, claims, &key)
                .map_err(|e| CryptoError::Key(format!("JWS sign failed: {e}")))
        }
        // ES512: same compact form, signed natively on P-521.
        None => sign_es512(jwk, claims),
    }
}

/// Verify a compact JWS under the given JWK and deserialize its claims.
///
/// `audience` is matched against the `aud` claim; `exp` is always enforced
/// with zero leeway.
pub fn verify_claims<T: DeserializeOwned>(
    jwk: &Jwk,
    token: &str,
    audience: &str,
) -> Result<T, VerifyError> {
    let entry =
        registry::lookup(&jwk.alg).map_err(|e| VerifyError::Malformed(e.to_string()))?;

    match entry.jwt {
        Some(alg) => {
            let key = decoding_key(jwk).map_err(|e| VerifyError::Malformed(e.to_string()))?;
            let mut validation = Validation::new(alg);
            validation.leeway = 0;
            validation.set_audience(&[audience]);
            decode::<T>(token, &key, &validation)
                .map(|data| data.claims)
                .map_err(|e| match e.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => VerifyError::Expired,
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => VerifyError::BadSignature,
                    jsonwebtoken::errors::ErrorKind::InvalidAudience => VerifyError::WrongAudience,
                    _ => VerifyError::Malformed(e.to_string()),
                })
        }
        None => verify_es512(jwk, token, audience),
    }
}

/// Extract the kid from a compact JWS header without verifying.
pub fn peek_kid(token: &str) -> Result<String, VerifyError> {
    let header = parse_header(token)?;
    header
        .kid
        .ok_or_else(|| VerifyError::Malformed("JWS header has no kid".into()))
}

struct PeekedHeader {
    alg: String,
    kid: Option<String>,
}

fn parse_header(token: &str) -> Result<PeekedHeader, VerifyError> {
    // jsonwebtoken rejects ES512 tokens at the header, so parse by hand for
    // the full algorithm set.
    let first = token
        .split('.')
        .next()
        .ok_or_else(|| VerifyError::Malformed("empty token".into()))?;
    let raw = ub64(first).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let value: Value =
        serde_json::from_slice(&raw).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let alg = value
        .get("alg")
        .and_then(Value::as_str)
        .ok_or_else(|| VerifyError::Malformed("JWS header has no alg".into()))?
        .to_string();
    let kid = value
        .get("kid")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(PeekedHeader { alg, kid })
}

fn encoding_key(jwk: &Jwk) -> Result<EncodingKey, CryptoError> {
    match jwk.key_material()? {
        KeyMaterial::Rsa(key) => {
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Key(format!("RSA PEM encode: {e}")))?;
            EncodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| CryptoError::Key(format!("RSA signing key: {e}")))
        }
        KeyMaterial::P256(key) => {
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Key(format!("P-256 PEM encode: {e}")))?;
            EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| CryptoError::Key(format!("P-256 signing key: {e}")))
        }
        KeyMaterial::P384(key) => {
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Key(format!("P-384 PEM encode: {e}")))?;
            EncodingKey::from_ec_pem(pem.as_bytes())
                .map_err(|e| CryptoError::Key(format!("P-384 signing key: {e}")))
        }
        KeyMaterial::Ed25519(key) => {
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::Key(format!("Ed25519 PEM encode: {e}")))?;
            EncodingKey::from_ed_pem(pem.as_bytes())
                .map_err(|e| CryptoError::Key(format!("Ed25519 signing key: {e}")))
        }
        KeyMaterial::Oct(secret) => Ok(EncodingKey::from_secret(&secret)),
        KeyMaterial::P521(_) => Err(CryptoError::Key(
            "ES512 uses the native signing path".into(),
        )),
    }
}

fn decoding_key(jwk: &Jwk) -> Result<DecodingKey, CryptoError> {
    match jwk.kty.as_str() {
        "RSA" => {
            let n = jwk
                .n
                .as_deref()
                .ok_or_else(|| CryptoError::Key("RSA JWK missing n".into()))?;
            let e = jwk
                .e
                .as_deref()
                .ok_or_else(|| CryptoError::Key("RSA JWK missing e".into()))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|err| CryptoError::Key(format!("RSA verification key: {err}")))
        }
        "EC" => {
            let x = jwk
                .x
                .as_deref()
                .ok_or_else(|| CryptoError::Key("EC JWK missing x".into()))?;
            let y = jwk
                .y
                .as_deref()
                .ok_or_else(|| CryptoError::Key("EC JWK missing y".into()))?;
            DecodingKey::from_ec_components(x, y)
                .map_err(|err| CryptoError::Key(format!("EC verification key: {err}")))
        }
        "OKP" => {
            let x = jwk
                .x
                .as_deref()
                .ok_or_else(|| CryptoError::Key("OKP JWK missing x".into()))?;
            DecodingKey::from_ed_components(x)
                .map_err(|err| CryptoError::Key(format!("Ed25519 verification key: {err}")))
        }
        "oct" => Ok(DecodingKey::from_secret(&jwk.symmetric_key()?)),
        other => Err(CryptoError::Key(format!("unsupported kty {other}"))),
    }
}

// ----------------------------------------------------------------------------
// ES512 native path
// ----------------------------------------------------------------------------

fn sign_es512<T: Serialize>(jwk: &Jwk, claims: &T) -> Result<String, CryptoError> {
    let secret = match jwk.key_material()? {
        KeyMaterial::P521(key) => key,
        _ => return Err(CryptoError::Key("ES512 requires a P-521 key".into())),
    };

    let header = serde_json::json!({ "typ": "JWT", "alg": "ES512", "kid": jwk.kid });
    let header_b64 = b64(
        serde_json::to_vec(&header)
            .map_err(|e| CryptoError::Key(format!("header encode: {e}")))?
            .as_slice(),
    );
    let payload_b64 = b64(
        serde_json::to_vec(claims)
            .map_err(|e| CryptoError::Key(format!("claims encode: {e}")))?
            .as_slice(),
    );
    let signing_input = format!("{header_b64}.{payload_b64}");

    let signing_key = P521SigningKey::from_slice(&secret.to_bytes())
        .map_err(|e| CryptoError::Key(format!("P-521 signing key: {e}")))?;
    let signature: P521Signature = signing_key.sign(signing_input.as_bytes());
    Ok(format!("{signing_input}.{}", b64(&signature.to_bytes())))
}

fn verify_es512<T: DeserializeOwned>(
    jwk: &Jwk,
    token: &str,
    audience: &str,
) -> Result<T, VerifyError> {
    let mut parts = token.split('.');
    let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
        _ => return Err(VerifyError::Malformed("JWS must have three parts".into())),
    };

    let header = parse_header(token)?;
    if header.alg != "ES512" {
        return Err(VerifyError::Malformed(format!(
            "expected ES512, found {}",
            header.alg
        )));
    }

    let verifying_key = es512_verifying_key(jwk).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let sig_bytes = ub64(sig_b64).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let signature = P521Signature::from_slice(&sig_bytes)
        .map_err(|_| VerifyError::BadSignature)?;

    let signing_input = format!("{header_b64}.{payload_b64}");
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| VerifyError::BadSignature)?;

    let payload = ub64(payload_b64).map_err(|e| VerifyError::Malformed(e.to_string()))?;
    let value: Value =
        serde_json::from_slice(&payload).map_err(|e| VerifyError::Malformed(e.to_string()))?;

    // Claims validation mirrors the jsonwebtoken settings: exp always, zero
    // leeway, audience exact.
    let exp = value
        .get("exp")
        .and_then(Value::as_i64)
        .ok_or_else(|| VerifyError::Malformed("claims missing exp".into()))?;
    if exp < chrono::Utc::now().timestamp() {
        return Err(VerifyError::Expired);
    }
    match value.get("aud").and_then(Value::as_str) {
        Some(aud) if aud == audience => {}
        _ => return Err(VerifyError::WrongAudience),
    }

    serde_json::from_value(value).map_err(|e| VerifyError::Malformed(e.to_string()))
}

fn es512_verifying_key(jwk: &Jwk) -> Result<P521VerifyingKey, CryptoError> {
    let x = ub64(
        jwk.x
            .as_deref()
            .ok_or_else(|| CryptoError::Key("EC JWK missing x".into()))?,
    )?;
    let y = ub64(
        jwk.y
            .as_deref()
            .ok_or_else(|| CryptoError::Key("EC JWK missing y".into()))?,
    )?;

    let point = p521::EncodedPoint::from_affine_coordinates(
        p521::FieldBytes::from_slice(&pad_left(&x, 66)),
        p521::FieldBytes::from_slice(&pad_left(&y, 66)),
        false,
    );
    P521VerifyingKey::from_encoded_point(&point)
        .map_err(|e| CryptoError::Key(format!("P-521 verification key: {e}")))
}

/// Left-pad a big-endian integer to a fixed width (coordinates may have had
/// leading zeroes dropped upstream).
fn pad_left(bytes: &[u8], width: usize) -> Vec<u8> {
    if bytes.len() >= width {
        return bytes[bytes.len() - width..].to_vec();
    }
    let mut out = vec![0u8; width - bytes.len()];
    out.extend_from_slice(bytes);
    out
}
