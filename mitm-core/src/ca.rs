use crate::error::MitmError;
use crate::Result;
use hudsucker::{certificate_authority::RcgenAuthority, rustls};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::fs;
use std::path::Path;
use time::{Duration, OffsetDateTime};
use tracing::info;

const CA_COMMON_NAME: &str = "MITM Hijack CA";
const CA_ORGANIZATION: &str = "MITM Hijack";
/// Leaf certificates kept by the listener
const LEAF_CACHE_SIZE: u64 = 1000;

/// Root CA used by the listener to mint per-host certificates.
///
/// Persisted as `ca.pem` / `ca.key` (plus a `ca.crt` copy for browsers).
pub struct CertificateAuthority {
    ca_cert: Certificate,
}

impl CertificateAuthority {
    /// Load the CA from `ca_dir`, generating it on first use.
    pub fn new(ca_dir: &Path) -> Result<Self> {
        let cert_path = ca_dir.join("ca.pem");
        let key_path = ca_dir.join("ca.key");

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = fs::read_to_string(&key_path)?;
            return Self::from_pem(&cert_pem, &key_pem);
        }

        fs::create_dir_all(ca_dir)?;
        let ca = Self::generate()?;
        let cert_pem = ca.ca_cert_pem()?;
        fs::write(&cert_path, &cert_pem)?;
        fs::write(&key_path, ca.ca_key_pem())?;
        fs::write(cert_path.with_extension("crt"), &cert_pem)?;
        info!("Generated new CA in {}", ca_dir.display());
        Ok(ca)
    }

    /// In-memory CA, nothing written to disk.
    pub fn ephemeral() -> Result<Self> {
        Self::generate()
    }

    fn params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, CA_ORGANIZATION);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params
    }

    /// Rebuilds the CA around a stored key. The subject is fixed, so leaf
    /// certificates chain to the stored certificate.
    pub fn from_pem(_cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| MitmError::Certificate(format!("Failed to parse CA key: {}", e)))?;
        let mut params = Self::params();
        params.key_pair = Some(key_pair);
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| MitmError::Certificate(format!("Failed to rebuild CA cert: {}", e)))?;
        Ok(Self { ca_cert })
    }

    fn generate() -> Result<Self> {
        let mut params = Self::params();
        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(365 * 10);
        params.key_pair = Some(
            KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
                .map_err(|e| MitmError::Certificate(format!("Failed to generate CA key: {}", e)))?,
        );
        let ca_cert = Certificate::from_params(params)
            .map_err(|e| MitmError::Certificate(format!("Failed to generate CA cert: {}", e)))?;
        Ok(Self { ca_cert })
    }

    pub fn ca_cert_pem(&self) -> Result<String> {
        self.ca_cert
            .serialize_pem()
            .map_err(|e| MitmError::Certificate(format!("Failed to serialize CA cert: {}", e)))
    }

    pub fn ca_key_pem(&self) -> String {
        self.ca_cert.serialize_private_key_pem()
    }

    /// Certificate authority in the form the listener consumes (DER).
    pub fn authority(&self) -> Result<RcgenAuthority> {
        let cert_der = self
            .ca_cert
            .serialize_der()
            .map_err(|e| MitmError::Certificate(format!("Failed to serialize CA cert DER: {}", e)))?;
        let key_der = self.ca_cert.serialize_private_key_der();

        RcgenAuthority::new(
            rustls::PrivateKey(key_der),
            rustls::Certificate(cert_der),
            LEAF_CACHE_SIZE,
        )
        .map_err(|e| MitmError::Certificate(format!("Failed to create CA authority: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ca_generation_and_reload() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::new(dir.path()).expect("Failed to create CA");
        assert!(dir.path().join("ca.pem").exists());
        assert!(dir.path().join("ca.key").exists());
        assert!(dir.path().join("ca.crt").exists());

        let reloaded = CertificateAuthority::new(dir.path()).expect("Failed to load CA");
        assert_eq!(reloaded.ca_key_pem(), ca.ca_key_pem());
        assert!(reloaded.authority().is_ok());
    }

    #[test]
    fn test_bad_key_is_certificate_error() {
        let err = CertificateAuthority::from_pem("", "not a key").err().unwrap();
        assert!(matches!(err, MitmError::Certificate(_)));
    }

    #[test]
    fn test_ephemeral_pem() {
        let ca = CertificateAuthority::ephemeral().unwrap();
        assert!(ca.ca_cert_pem().unwrap().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("PRIVATE KEY"));
    }
}
