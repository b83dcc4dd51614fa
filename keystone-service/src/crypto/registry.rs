//! Declarative algorithm registry
//!
//! One table maps every supported JOSE algorithm name to its kind, key
//! parameters, and (where applicable) the `jsonwebtoken` binding. All key
//! generation and JOSE operations consult this table; a lookup miss fails
//! closed with `ErrUnsupportedAlgorithm`.

use jsonwebtoken::Algorithm;

use crate::error::CryptoError;

/// Whether an algorithm signs or encrypts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmKind {
    /// JWS signing algorithm
    Signature,
    /// JWE content-encryption algorithm
    Encryption,
}

/// Elliptic curves used by the ES* family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    /// JOSE `crv` parameter value
    pub fn crv(&self) -> &'static str {
        match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
            Self::P521 => "P-521",
        }
    }

    /// Field element size in bytes (coordinate and scalar length)
    pub fn field_len(&self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }
}

/// Key-generation parameters for one algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyParams {
    /// RSA keypair of the given modulus size
    Rsa { bits: usize },
    /// ECDSA keypair on the given curve
    Ec { curve: EcCurve },
    /// Ed25519 keypair
    Ed25519,
    /// Symmetric key of the given byte length
    Oct { len: usize },
}

/// One registry row
#[derive(Debug, Clone, Copy)]
pub struct AlgorithmEntry {
    /// JOSE algorithm name (`alg` for signatures, `enc` for encryption)
    pub name: &'static str,
    /// Signature or encryption
    pub kind: AlgorithmKind,
    /// Key-generation parameters
    pub key: KeyParams,
    /// `jsonwebtoken` binding for JWS algorithms it supports
    pub jwt: Option<Algorithm>,
}

impl AlgorithmEntry {
    /// True for JWS signing algorithms
    pub fn is_signing(&self) -> bool {
        self.kind == AlgorithmKind::Signature
    }

    /// True for JWE content-encryption algorithms
    pub fn is_encryption(&self) -> bool {
        self.kind == AlgorithmKind::Encryption
    }
}

/// The complete algorithm table.
///
/// Order is stable; tests enumerate it. Adding an algorithm means adding a
/// row here and nothing else gains implicit support.
pub const REGISTRY: &[AlgorithmEntry] = &[
    // RSASSA-PKCS1-v1_5
    AlgorithmEntry {
        name: "RS256",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Rsa { bits: 2048 },
        jwt: Some(Algorithm::RS256),
    },
    AlgorithmEntry {
        name: "RS384",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Rsa { bits: 3072 },
        jwt: Some(Algorithm::RS384),
    },
    AlgorithmEntry {
        name: "RS512",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Rsa { bits: 4096 },
        jwt: Some(Algorithm::RS512),
    },
    // ECDSA
    AlgorithmEntry {
        name: "ES256",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Ec {
            curve: EcCurve::P256,
        },
        jwt: Some(Algorithm::ES256),
    },
    AlgorithmEntry {
        name: "ES384",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Ec {
            curve: EcCurve::P384,
        },
        jwt: Some(Algorithm::ES384),
    },
    // jsonwebtoken has no ES512 binding; jws.rs carries a native P-521 path.
    AlgorithmEntry {
        name: "ES512",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Ec {
            curve: EcCurve::P521,
        },
        jwt: None,
    },
    // EdDSA (Ed25519)
    AlgorithmEntry {
        name: "EdDSA",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Ed25519,
        jwt: Some(Algorithm::EdDSA),
    },
    // HMAC
    AlgorithmEntry {
        name: "HS256",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Oct { len: 32 },
        jwt: Some(Algorithm::HS256),
    },
    AlgorithmEntry {
        name: "HS384",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Oct { len: 48 },
        jwt: Some(Algorithm::HS384),
    },
    AlgorithmEntry {
        name: "HS512",
        kind: AlgorithmKind::Signature,
        key: KeyParams::Oct { len: 64 },
        jwt: Some(Algorithm::HS512),
    },
    // AES-GCM content encryption
    AlgorithmEntry {
        name: "A128GCM",
        kind: AlgorithmKind::Encryption,
        key: KeyParams::Oct { len: 16 },
        jwt: None,
    },
    AlgorithmEntry {
        name: "A192GCM",
        kind: AlgorithmKind::Encryption,
        key: KeyParams::Oct { len: 24 },
        jwt: None,
    },
    AlgorithmEntry {
        name: "A256GCM",
        kind: AlgorithmKind::Encryption,
        key: KeyParams::Oct { len: 32 },
        jwt: None,
    },
    // AES-CBC + HMAC composite content encryption (RFC 7518 §5.2)
    AlgorithmEntry {
        name: "A128CBC-HS256",
        kind: AlgorithmKind::Encryption,
        key: KeyParams::Oct { len: 32 },
        jwt: None,
    },
    AlgorithmEntry {
        name: "A192CBC-HS384",
        kind: AlgorithmKind::Encryption,
        key: KeyParams::Oct { len: 48 },
        jwt: None,
    },
    AlgorithmEntry {
        name: "A256CBC-HS512",
        kind: AlgorithmKind::Encryption,
        key: KeyParams::Oct { len: 64 },
        jwt: None,
    },
];

/// Look up an algorithm by name; fails closed on a miss.
pub fn lookup(name: &str) -> Result<&'static AlgorithmEntry, CryptoError> {
    REGISTRY
        .iter()
        .find(|entry| entry.name == name)
        .ok_or_else(|| CryptoError::UnsupportedAlgorithm(name.to_string()))
}

/// All signing algorithm names
pub fn signing_algorithms() -> impl Iterator<Item = &'static str> {
    REGISTRY
        .iter()
        .filter(|e| e.is_signing())
        .map(|e| e.name)
}

/// All content-encryption algorithm names
pub fn encryption_algorithms() -> impl Iterator<Item = &'static str> {
    REGISTRY
        .iter()
        .filter(|e| e.is_encryption())
        .map(|e| e.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_miss_fails_closed() {
        assert!(matches!(
            lookup("none"),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            lookup("RS255"),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn every_declared_algorithm_resolves() {
        for name in [
            "RS256",
            "RS384",
            "RS512",
            "ES256",
            "ES384",
            "ES512",
            "EdDSA",
            "HS256",
            "HS384",
            "HS512",
            "A128GCM",
            "A192GCM",
            "A256GCM",
            "A128CBC-HS256",
            "A192CBC-HS384",
            "A256CBC-HS512",
        ] {
            let entry = lookup(name).unwrap_or_else(|_| panic!("missing registry row: {name}"));
            assert_eq!(entry.name, name);
        }
    }

    #[test]
    fn cbc_composite_key_lengths_cover_mac_and_enc_halves() {
        for (name, len) in [
            ("A128CBC-HS256", 32),
            ("A192CBC-HS384", 48),
            ("A256CBC-HS512", 64),
        ] {
            match lookup(name).unwrap().key {
                KeyParams::Oct { len: l } => assert_eq!(l, len),
                _ => panic!("{name} must be a symmetric key"),
            }
        }
    }

    #[test]
    fn signing_and_encryption_partitions_are_disjoint() {
        let signing: Vec<_> = signing_algorithms().collect();
        let encryption: Vec<_> = encryption_algorithms().collect();
        assert_eq!(signing.len() + encryption.len(), REGISTRY.len());
        for name in &signing {
            assert!(!encryption.contains(name));
        }
    }
}
