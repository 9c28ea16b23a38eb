//! Leaf certificate issuance for intercepted TLS connections.
//!
//! The authority signs one certificate per SNI host with the root CA key and
//! caches the resulting rustls server configuration for the process lifetime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

use crate::error::CaManagerError;

/// ALPN protocol offered to intercepted clients.
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Leaf validity in days.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Returns the crypto provider used for every TLS configuration.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Returns 16 random bytes usable as a positive certificate serial.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x01;
    SerialNumber::from_slice(&bytes)
}

/// The loaded root CA, able to mint per-host leaf certificates.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
    cache: Mutex<HashMap<String, Arc<ServerConfig>>>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_len", &self.ca_cert_der.len())
            .field("cached_hosts", &self.cache.lock().len())
            .finish()
    }
}

impl CertificateAuthority {
    /// Builds an authority from the CA certificate PEM and its key pair.
    pub fn from_pem(cert_pem: &str, key_pair: KeyPair) -> Result<Self, CaManagerError> {
        let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaManagerError::Parse("No certificate found in PEM".into()))?
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaManagerError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            ca_cert_der,
            provider: crypto_provider(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// DER encoding of the root certificate.
    pub fn ca_cert_der(&self) -> &CertificateDer<'static> {
        &self.ca_cert_der
    }

    /// Number of hosts with a cached leaf.
    pub fn cached_hosts(&self) -> usize {
        self.cache.lock().len()
    }

    /// Issues a leaf certificate chain `[leaf, ca]` and its private key.
    pub fn issue_leaf(
        &self,
        host: &str,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), CaManagerError> {
        let host = normalize_host(host);
        let mut params = CertificateParams::default();
        params.serial_number = Some(random_serial());

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.as_str());
        params.distinguished_name = dn;

        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(host.as_str().try_into().map_err(|_| {
                CaManagerError::Generation(format!("Invalid host name: {}", host))
            })?)],
        };
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let key_pair =
            KeyPair::generate().map_err(|e| CaManagerError::Generation(e.to_string()))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;

        let chain = vec![
            CertificateDer::from(cert.der().to_vec()),
            self.ca_cert_der.clone(),
        ];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        Ok((chain, key))
    }

    /// Returns the TLS server configuration for `host`, issuing it on first use.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaManagerError> {
        let host = normalize_host(host);
        if let Some(config) = self.cache.lock().get(&host) {
            return Ok(Arc::clone(config));
        }

        let (chain, key) = self.issue_leaf(&host)?;
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| CaManagerError::Generation(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CaManagerError::Generation(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];

        let config = Arc::new(config);
        self.cache.lock().insert(host.clone(), Arc::clone(&config));
        tracing::debug!("Issued leaf certificate for {}", host);
        Ok(config)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}
