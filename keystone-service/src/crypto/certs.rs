//! TLS certificate issuance
//!
//! End-entity certificates are ECDSA-P256 by default, issued either
//! self-signed (development `auto` mode) or signed by a CA bundle loaded from
//! disk (`mixed` / `upstream_ca` modes).

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
};
use std::net::IpAddr;

use crate::error::{CryptoError, Error, Result};

/// A freshly issued certificate and its private key, both PEM-encoded.
#[derive(Debug)]
pub struct IssuedCert {
    /// Certificate (leaf only; callers append the chain if needed)
    pub cert_pem: String,
    /// PKCS#8 private key
    pub key_pem: String,
}

fn leaf_params(
    dns_sans: &[String],
    ip_sans: &[IpAddr],
    validity_days: u32,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(dns_sans.to_vec())
        .map_err(|e| CryptoError::Key(format!("certificate SANs invalid: {e}")))?;
    for ip in ip_sans {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let mut dn = DistinguishedName::new();
    let cn = dns_sans
        .first()
        .map(String::as_str)
        .unwrap_or("keystone-service");
    dn.push(DnType::CommonName, cn);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(validity_days));

    Ok(params)
}

/// Generate a self-signed ECDSA-P256 certificate (development TLS).
pub fn self_signed(
    dns_sans: &[String],
    ip_sans: &[IpAddr],
    validity_days: u32,
) -> Result<IssuedCert> {
    let key_pair = KeyPair::generate()
        .map_err(|e| CryptoError::Key(format!("leaf keypair generation failed: {e}")))?;
    let params = leaf_params(dns_sans, ip_sans, validity_days)?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::Key(format!("self-signed issuance failed: {e}")))?;

    Ok(IssuedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Issue a leaf certificate signed by the given CA certificate and key.
pub fn issue_from_ca(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    dns_sans: &[String],
    ip_sans: &[IpAddr],
    validity_days: u32,
) -> Result<IssuedCert> {
    let ca_key = KeyPair::from_pem(ca_key_pem)
        .map_err(|e| Error::Config(format!("CA key is not valid PEM: {e}")))?;
    let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| Error::Config(format!("CA certificate is not valid PEM: {e}")))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| Error::Config(format!("CA bundle could not be reconstructed: {e}")))?;

    let leaf_key = KeyPair::generate()
        .map_err(|e| CryptoError::Key(format!("leaf keypair generation failed: {e}")))?;
    let params = leaf_params(dns_sans, ip_sans, validity_days)?;
    let leaf = params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .map_err(|e| CryptoError::Key(format!("CA-signed issuance failed: {e}")))?;

    Ok(IssuedCert {
        cert_pem: leaf.pem(),
        key_pem: leaf_key.serialize_pem(),
    })
}

/// Generate a CA certificate + key (used by tests and local tooling).
pub fn generate_ca(common_name: &str, validity_days: u32) -> Result<IssuedCert> {
    let key_pair = KeyPair::generate()
        .map_err(|e| CryptoError::Key(format!("CA keypair generation failed: {e}")))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| CryptoError::Key(format!("CA params invalid: {e}")))?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(i64::from(validity_days));

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::Key(format!("CA issuance failed: {e}")))?;

    Ok(IssuedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_emits_pem_pair() {
        let cert = self_signed(&["localhost".to_string()], &[], 30).unwrap();
        assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn ca_signed_leaf_round_trip() {
        let ca = generate_ca("keystone test CA", 365).unwrap();
        let leaf = issue_from_ca(
            &ca.cert_pem,
            &ca.key_pem,
            &["svc.internal".to_string()],
            &[IpAddr::from([127, 0, 0, 1])],
            30,
        )
        .unwrap();
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn garbage_ca_rejected_as_config_error() {
        let err = issue_from_ca("not pem", "not pem", &["x".to_string()], &[], 1).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
