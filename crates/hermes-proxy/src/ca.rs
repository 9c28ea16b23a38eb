//! Certificate Authority management for the MITM proxy.
//!
//! Generates and manages the root CA certificate used to sign per-host
//! certificates on the fly. Layout under the CA directory:
//!
//! ```text
//! certs/ca.pem          root certificate
//! keys/ca.private.key   root private key (PKCS#8 PEM)
//! keys/ca.public.key    root public key (PEM)
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

use crate::authority::{random_serial, CertificateAuthority};
pub use crate::error::CaManagerError;

/// Common name of the root certificate.
pub const CA_COMMON_NAME: &str = "HermesProxyCA";

const CA_CERT_PATH: &str = "certs/ca.pem";
const CA_PRIVATE_KEY_PATH: &str = "keys/ca.private.key";
const CA_PUBLIC_KEY_PATH: &str = "keys/ca.public.key";

/// Root validity in days (10 years).
const CA_VALIDITY_DAYS: i64 = 3650;

/// Manages the root CA certificate for the MITM proxy.
#[derive(Debug, Clone)]
pub struct CaManager {
    /// Path to the CA directory.
    ca_dir: PathBuf,
    /// Loaded authority, shared by every clone of this manager.
    authority: Arc<OnceCell<Arc<CertificateAuthority>>>,
}

impl CaManager {
    /// Creates a new CA manager with the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
            authority: Arc::new(OnceCell::new()),
        }
    }

    /// Returns the CA directory.
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the path to the CA certificate file.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_PATH)
    }

    /// Returns the path to the CA private key file.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_PRIVATE_KEY_PATH)
    }

    /// Returns the path to the CA public key file.
    pub fn public_key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_PUBLIC_KEY_PATH)
    }

    /// Checks if the CA certificate and key exist.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Returns true if the stored certificate carries the expected subject CN.
    pub fn has_valid_subject(&self) -> bool {
        fs::read_to_string(self.cert_path())
            .ok()
            .and_then(|pem| read_common_name(&pem))
            .is_some_and(|cn| cn == CA_COMMON_NAME)
    }

    /// Ensures a valid CA exists, generating it if missing, unreadable or
    /// carrying a different subject, and returns the loaded authority.
    pub fn ensure_ca(&self) -> Result<CertificateAuthority, CaManagerError> {
        if self.ca_exists() && self.has_valid_subject() {
            match self.load_authority() {
                Ok(authority) => return Ok(authority),
                Err(e) => tracing::warn!("Existing CA is unusable, regenerating: {}", e),
            }
        } else if self.ca_exists() {
            tracing::warn!("CA subject mismatch at {:?}, regenerating", self.cert_path());
        }

        self.generate_ca()?;
        self.load_authority()
    }

    /// Returns the shared authority, loading or generating it on first use.
    ///
    /// Concurrent callers wait for the same blocking generation.
    pub async fn authority(&self) -> Result<Arc<CertificateAuthority>, CaManagerError> {
        self.authority
            .get_or_try_init(|| async {
                let manager = self.clone();
                tokio::task::spawn_blocking(move || manager.ensure_ca())
                    .await
                    .map_err(|e| CaManagerError::Generation(e.to_string()))?
                    .map(Arc::new)
            })
            .await
            .map(Arc::clone)
    }

    /// Generates a new root CA certificate and key pair.
    pub fn generate_ca(&self) -> Result<(), CaManagerError> {
        fs::create_dir_all(self.ca_dir.join("certs"))?;
        fs::create_dir_all(self.ca_dir.join("keys"))?;

        let key_pair = KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CA_COMMON_NAME);
        dn.push(DnType::OrganizationName, "Hermes Proxy");
        dn.push(DnType::OrganizationalUnitName, "CA");
        dn.push(DnType::LocalityName, "Internet");
        dn.push(DnType::StateOrProvinceName, "Internet");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::ContentCommitment,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsagePurpose::TimeStamping,
        ];

        let not_before = OffsetDateTime::now_utc() - Duration::days(1);
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(CA_VALIDITY_DAYS);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem()).map_err(|e| CaManagerError::Write(e.to_string()))?;
        fs::write(self.key_path(), key_pair.serialize_pem())
            .map_err(|e| CaManagerError::Write(e.to_string()))?;
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.der())
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let public_pem = pem::encode(&pem::Pem::new("PUBLIC KEY", parsed.public_key().raw.to_vec()));
        fs::write(self.public_key_path(), public_pem)
            .map_err(|e| CaManagerError::Write(e.to_string()))?;

        tracing::info!("Generated new CA certificate at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the CA certificate and key from disk.
    pub fn load_authority(&self) -> Result<CertificateAuthority, CaManagerError> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| CaManagerError::Parse(e.to_string()))?;
        CertificateAuthority::from_pem(&cert_pem, key_pair)
    }

    /// Writes the certificate in DER form to `dest`.
    pub fn export_der_to(&self, dest: &Path) -> Result<(), CaManagerError> {
        let der = export_der(&self.cert_path())?
            .ok_or_else(|| CaManagerError::Parse("No certificate found in PEM".into()))?;
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(dest, der).map_err(|e| CaManagerError::Write(e.to_string()))?;
        tracing::info!("Exported CA certificate to {:?}", dest);
        Ok(())
    }
}

/// Converts a PEM certificate file to DER.
///
/// Returns `Ok(None)` when the file holds no `CERTIFICATE` block.
pub fn export_der(cert_path: &Path) -> Result<Option<Vec<u8>>, CaManagerError> {
    let text = fs::read_to_string(cert_path)?;
    let blocks = match pem::parse_many(text.as_bytes()) {
        Ok(blocks) => blocks,
        Err(e) => {
            tracing::debug!("Unparseable PEM at {:?}: {}", cert_path, e);
            return Ok(None);
        }
    };
    Ok(blocks
        .into_iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.into_contents()))
}

/// Reads the subject common name of the first certificate in a PEM string.
pub fn read_common_name(cert_pem: &str) -> Option<String> {
    let der = rustls_pemfile::certs(&mut cert_pem.as_bytes()).next()?.ok()?;
    let (_, cert) = x509_parser::parse_x509_certificate(&der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ca_manager_paths() {
        let manager = CaManager::new("/tmp/test-ca");
        assert_eq!(manager.cert_path(), PathBuf::from("/tmp/test-ca/certs/ca.pem"));
        assert_eq!(
            manager.key_path(),
            PathBuf::from("/tmp/test-ca/keys/ca.private.key")
        );
        assert_eq!(
            manager.public_key_path(),
            PathBuf::from("/tmp/test-ca/keys/ca.public.key")
        );
    }

    #[test]
    fn ca_manager_not_exists_initially() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        assert!(!manager.ca_exists());
    }

    #[test]
    fn generate_writes_all_files_with_subject() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.generate_ca().unwrap();
        assert!(manager.cert_path().exists());
        assert!(manager.key_path().exists());
        let public = fs::read_to_string(manager.public_key_path()).unwrap();
        assert!(public.contains("BEGIN PUBLIC KEY"));

        let pem = fs::read_to_string(manager.cert_path()).unwrap();
        assert_eq!(read_common_name(&pem).as_deref(), Some(CA_COMMON_NAME));

        let der = export_der(&manager.cert_path()).unwrap().unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(&der).unwrap();
        assert!(cert.is_ca());
        assert_eq!(cert.raw_serial().len(), 16);
        let validity = cert.validity();
        let years = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
        assert_eq!(years, CA_VALIDITY_DAYS);
    }

    #[test]
    fn ensure_ca_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        manager.ensure_ca().unwrap();
        let first = fs::read_to_string(manager.cert_path()).unwrap();
        manager.ensure_ca().unwrap();
        let second = fs::read_to_string(manager.cert_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn ensure_ca_regenerates_on_subject_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();

        // replace the cert with one carrying another CN
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Someone Else");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let foreign = params.self_signed(&key_pair).unwrap();
        fs::write(manager.cert_path(), foreign.pem()).unwrap();
        assert!(!manager.has_valid_subject());

        manager.ensure_ca().unwrap();
        assert!(manager.has_valid_subject());
    }

    #[test]
    fn ensure_ca_regenerates_on_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.generate_ca().unwrap();
        fs::write(manager.key_path(), "garbage").unwrap();

        assert!(manager.ensure_ca().is_ok());
        assert!(manager.has_valid_subject());
    }

    #[test]
    fn export_der_without_certificate_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.pem");
        fs::write(&path, "no pem here").unwrap();
        assert!(export_der(&path).unwrap().is_none());
    }

    #[test]
    fn export_der_to_writes_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));
        manager.ensure_ca().unwrap();

        let dest = temp_dir.path().join("out").join("hermes-ca.der");
        manager.export_der_to(&dest).unwrap();
        let der = fs::read(&dest).unwrap();
        assert!(x509_parser::parse_x509_certificate(&der).is_ok());
    }

    #[tokio::test]
    async fn authority_is_single_flight() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CaManager::new(temp_dir.path().join("ca"));

        let other = manager.clone();
        let (a, b) = tokio::join!(manager.authority(), other.authority());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));

        let again = manager.authority().await.unwrap();
        assert!(Arc::ptr_eq(&a, &again));
    }
}
