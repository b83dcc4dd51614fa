//! Compact JWE encryption and decryption
//!
//! Direct key agreement only (`alg: dir`): the content-encryption key *is*
//! the key named by the header kid. That covers every JWE in the suite — the
//! barrier wraps each level's JWK under the level above, and JWE-form session
//! tokens are encrypted under the tenant's symmetric session key.
//!
//! All six registry `enc` values are implemented: the GCM family through
//! `aes-gcm`, the CBC+HMAC composites per RFC 7518 §5.2 with constant-time
//! tag comparison.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{AesGcm, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use super::jwk::{b64, ub64};
use super::registry::{self, KeyParams};
use crate::error::CryptoError;

type Aes128Gcm = AesGcm<aes::Aes128, aes_gcm::aead::consts::U12>;
type Aes192Gcm = AesGcm<aes::Aes192, aes_gcm::aead::consts::U12>;
type Aes256Gcm = AesGcm<aes::Aes256, aes_gcm::aead::consts::U12>;

/// Protected header of a direct-encryption compact JWE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JweHeader {
    /// Key management algorithm (always `dir` here)
    pub alg: String,
    /// Content encryption algorithm
    pub enc: String,
    /// Key id of the content-encryption key
    pub kid: String,
}

/// Encrypt `plaintext` into a compact JWE under a symmetric key.
///
/// The key length must match the registry entry for `enc`.
pub fn encrypt(
    enc: &str,
    key: &[u8],
    kid: &str,
    plaintext: &[u8],
) -> Result<String, CryptoError> {
    let entry = registry::lookup(enc)?;
    if !entry.is_encryption() {
        return Err(CryptoError::UnsupportedAlgorithm(format!(
            "{enc} is not a content-encryption algorithm"
        )));
    }
    check_key_len(enc, key, entry.key)?;

    let header = JweHeader {
        alg: "dir".to_string(),
        enc: enc.to_string(),
        kid: kid.to_string(),
    };
    let header_b64 = b64(&serde_json::to_vec(&header)
        .map_err(|e| CryptoError::Key(format!("JWE header encode: {e}")))?);
    let aad = header_b64.as_bytes();

    let (iv, ciphertext, tag) = match enc {
        "A128GCM" => gcm_encrypt::<Aes128Gcm>(key, aad, plaintext)?,
        "A192GCM" => gcm_encrypt::<Aes192Gcm>(key, aad, plaintext)?,
        "A256GCM" => gcm_encrypt::<Aes256Gcm>(key, aad, plaintext)?,
        "A128CBC-HS256" | "A192CBC-HS384" | "A256CBC-HS512" => {
            cbc_hmac_encrypt(enc, key, aad, plaintext)?
        }
        _ => unreachable!("registry guarantees an encryption algorithm"),
    };

    // Compact serialization with an empty encrypted-key part (dir).
    Ok(format!(
        "{header_b64}..{}.{}.{}",
        b64(&iv),
        b64(&ciphertext),
        b64(&tag)
    ))
}

/// Parse the protected header of a compact JWE without decrypting.
pub fn peek_header(token: &str) -> Result<JweHeader, CryptoError> {
    let header_b64 = token
        .split('.')
        .next()
        .ok_or_else(|| CryptoError::BadCiphertext("empty JWE".into()))?;
    let raw = ub64(header_b64)?;
    serde_json::from_slice(&raw)
        .map_err(|e| CryptoError::BadCiphertext(format!("JWE header decode: {e}")))
}

/// Decrypt a compact JWE with the symmetric key its header names.
pub fn decrypt(key: &[u8], token: &str) -> Result<Vec<u8>, CryptoError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 5 {
        return Err(CryptoError::BadCiphertext(
            "JWE must have five parts".into(),
        ));
    }
    let (header_b64, encrypted_key, iv_b64, ct_b64, tag_b64) =
        (parts[0], parts[1], parts[2], parts[3], parts[4]);

    if !encrypted_key.is_empty() {
        return Err(CryptoError::BadCiphertext(
            "direct encryption carries no encrypted key".into(),
        ));
    }

    let header: JweHeader = serde_json::from_slice(&ub64(header_b64)?)
        .map_err(|e| CryptoError::BadCiphertext(format!("JWE header decode: {e}")))?;
    if header.alg != "dir" {
        return Err(CryptoError::BadCiphertext(format!(
            "unsupported JWE alg {}",
            header.alg
        )));
    }
    let entry = registry::lookup(&header.enc)?;
    check_key_len(&header.enc, key, entry.key)?;

    let aad = header_b64.as_bytes();
    let iv = ub64(iv_b64)?;
    let ciphertext = ub64(ct_b64)?;
    let tag = ub64(tag_b64)?;

    match header.enc.as_str() {
        "A128GCM" => gcm_decrypt::<Aes128Gcm>(key, aad, &iv, &ciphertext, &tag),
        "A192GCM" => gcm_decrypt::<Aes192Gcm>(key, aad, &iv, &ciphertext, &tag),
        "A256GCM" => gcm_decrypt::<Aes256Gcm>(key, aad, &iv, &ciphertext, &tag),
        "A128CBC-HS256" | "A192CBC-HS384" | "A256CBC-HS512" => {
            cbc_hmac_decrypt(&header.enc, key, aad, &iv, &ciphertext, &tag)
        }
        _ => unreachable!("registry guarantees an encryption algorithm"),
    }
}

fn check_key_len(enc: &str, key: &[u8], params: KeyParams) -> Result<(), CryptoError> {
    match params {
        KeyParams::Oct { len } if key.len() == len => Ok(()),
        KeyParams::Oct { len } => Err(CryptoError::Key(format!(
            "{enc} requires a {len}-byte key, got {}",
            key.len()
        ))),
        _ => Err(CryptoError::Key(format!("{enc} requires a symmetric key"))),
    }
}

// ----------------------------------------------------------------------------
// AES-GCM
// ----------------------------------------------------------------------------

fn gcm_encrypt<C>(
    key: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError>
where
    C: Aead + KeyInit,
{
    let cipher = C::new_from_slice(key)
        .map_err(|_| CryptoError::Key("GCM key length mismatch".into()))?;

    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);

    let mut sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Key("GCM encryption failed".into()))?;

    // aes-gcm appends the 16-byte tag to the ciphertext.
    let tag = sealed.split_off(sealed.len() - 16);
    Ok((iv.to_vec(), sealed, tag))
}

fn gcm_decrypt<C>(
    key: &[u8],
    aad: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError>
where
    C: Aead + KeyInit,
{
    if iv.len() != 12 || tag.len() != 16 {
        return Err(CryptoError::BadCiphertext("bad GCM iv or tag length".into()));
    }
    let cipher = C::new_from_slice(key)
        .map_err(|_| CryptoError::Key("GCM key length mismatch".into()))?;

    let mut sealed = ciphertext.to_vec();
    sealed.extend_from_slice(tag);

    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: &sealed,
                aad,
            },
        )
        .map_err(|_| CryptoError::BadCiphertext("GCM authentication failed".into()))
}

// ----------------------------------------------------------------------------
// AES-CBC + HMAC (RFC 7518 §5.2)
// ----------------------------------------------------------------------------

fn cbc_hmac_encrypt(
    enc: &str,
    key: &[u8],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError> {
    let half = key.len() / 2;
    let (mac_key, enc_key) = key.split_at(half);

    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = cbc_encrypt(enc, enc_key, &iv, plaintext)?;
    let tag = cbc_hmac_tag(enc, mac_key, aad, &iv, &ciphertext)?;
    Ok((iv.to_vec(), ciphertext, tag))
}

fn cbc_hmac_decrypt(
    enc: &str,
    key: &[u8],
    aad: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != 16 {
        return Err(CryptoError::BadCiphertext("bad CBC iv length".into()));
    }
    let half = key.len() / 2;
    let (mac_key, enc_key) = key.split_at(half);

    let expected = cbc_hmac_tag(enc, mac_key, aad, iv, ciphertext)?;
    if expected.ct_eq(tag).unwrap_u8() != 1 {
        return Err(CryptoError::BadCiphertext(
            "CBC-HMAC authentication failed".into(),
        ));
    }

    cbc_decrypt(enc, enc_key, iv, ciphertext)
}

fn cbc_encrypt(
    enc: &str,
    enc_key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};

    macro_rules! run {
        ($cipher:ty) => {
            <$cipher>::new_from_slices(enc_key, iv)
                .map_err(|_| CryptoError::Key("CBC key length mismatch".into()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
        };
    }

    Ok(match enc {
        "A128CBC-HS256" => run!(cbc::Encryptor<aes::Aes128>),
        "A192CBC-HS384" => run!(cbc::Encryptor<aes::Aes192>),
        "A256CBC-HS512" => run!(cbc::Encryptor<aes::Aes256>),
        _ => unreachable!(),
    })
}

fn cbc_decrypt(
    enc: &str,
    enc_key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

    macro_rules! run {
        ($cipher:ty) => {
            <$cipher>::new_from_slices(enc_key, iv)
                .map_err(|_| CryptoError::Key("CBC key length mismatch".into()))?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::BadCiphertext("CBC padding invalid".into()))?
        };
    }

    Ok(match enc {
        "A128CBC-HS256" => run!(cbc::Decryptor<aes::Aes128>),
        "A192CBC-HS384" => run!(cbc::Decryptor<aes::Aes192>),
        "A256CBC-HS512" => run!(cbc::Decryptor<aes::Aes256>),
        _ => unreachable!(),
    })
}

/// AL block: AAD length in bits, 64-bit big-endian.
fn al_block(aad: &[u8]) -> [u8; 8] {
    ((aad.len() as u64) * 8).to_be_bytes()
}

fn cbc_hmac_tag(
    enc: &str,
    mac_key: &[u8],
    aad: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    macro_rules! run {
        ($hash:ty) => {{
            let mut mac = <Hmac<$hash> as Mac>::new_from_slice(mac_key)
                .map_err(|_| CryptoError::Key("HMAC key length invalid".into()))?;
            mac.update(aad);
            mac.update(iv);
            mac.update(ciphertext);
            mac.update(&al_block(aad));
            mac.finalize().into_bytes().to_vec()
        }};
    }

    let full = match enc {
        "A128CBC-HS256" => run!(Sha256),
        "A192CBC-HS384" => run!(Sha384),
        "A256CBC-HS512" => run!(Sha512),
        _ => unreachable!(),
    };
    // Tag is the first half of the MAC output.
    Ok(full[..mac_key.len()].to_vec())
}
