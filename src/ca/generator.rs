//! Root pair generation and per-host leaf issuance using rcgen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::keys::{self, LEAF_VALIDITY, ROOT_VALIDITY};

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("failed to generate RSA key: {0}")]
    KeyGeneration(#[source] rsa::Error),
    #[error("secure random source unavailable: {0}")]
    Random(String),
    #[error("invalid validity window: {0}")]
    Validity(String),
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("failed to serialize key")]
    KeySerialization,
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("no PEM block found in {}", .0.display())]
    Pem(PathBuf),
    #[error("unsupported private key in {}: expected an RSA key", .0.display())]
    UnsupportedKey(PathBuf),
}

/// Common name shared by the subject and issuer of every generated root.
pub const ROOT_COMMON_NAME: &str = "sni-mitm CA";

/// The root certificate and its private key.
///
/// Immutable once built. The certificate is expected to carry the public half
/// of `key`; loading code is responsible for pairing them correctly.
pub struct RootAuthority {
    cert_der: CertificateDer<'static>,
    key: RsaPrivateKey,
}

impl RootAuthority {
    /// Generates a fresh RSA-2048 root with `KeyUsage=CertSign` and
    /// `BasicConstraints: CA=true`, valid for three years from the start of the
    /// current validity period.
    pub fn generate() -> CaResult<Self> {
        let key = keys::generate_rsa_key()?;
        let key_pair = keys::signing_key_pair(&keys::pkcs8_der(&key)?)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(keys::random_serial()?);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];

        let (not_before, not_after) =
            keys::validity_window(OffsetDateTime::now_utc(), ROOT_VALIDITY)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params.self_signed(&key_pair).map_err(CaError::Signing)?;

        debug!("generated root certificate valid until {}", not_after);

        Ok(Self {
            cert_der: cert.der().clone(),
            key,
        })
    }

    /// Wraps previously loaded root material without further validation.
    pub fn from_parts(cert_der: CertificateDer<'static>, key: RsaPrivateKey) -> Self {
        Self { cert_der, key }
    }

    /// Returns the root certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Returns the root private key.
    pub fn key(&self) -> &RsaPrivateKey {
        &self.key
    }
}

/// A leaf certificate and its private key, ready for a TLS handshake.
pub struct IssuedCertificate {
    chain: Vec<CertificateDer<'static>>,
    key_der: PrivatePkcs8KeyDer<'static>,
    certified_key: Arc<CertifiedKey>,
}

impl IssuedCertificate {
    /// Returns the leaf certificate in DER format.
    pub fn leaf_der(&self) -> &CertificateDer<'static> {
        &self.chain[0]
    }

    /// Returns the certificate chain served to clients.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Returns the leaf private key in PKCS#8 DER format.
    pub fn key_der(&self) -> &PrivatePkcs8KeyDer<'static> {
        &self.key_der
    }

    /// Returns the chain and signing key in the form rustls consumes.
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Signs leaf certificates with a root key pair.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_cert_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Builds an authority around the given root pair.
    pub fn new(root: &RootAuthority) -> CaResult<Self> {
        let key_pair = keys::signing_key_pair(&keys::pkcs8_der(root.key())?)?;
        let issuer =
            Issuer::from_ca_cert_der(root.cert_der(), key_pair).map_err(CaError::Signing)?;
        Ok(Self {
            issuer,
            root_cert_der: root.cert_der().clone(),
        })
    }

    /// Returns the root certificate in DER format.
    pub fn root_cert_der(&self) -> &CertificateDer<'static> {
        &self.root_cert_der
    }

    /// Signs a fresh leaf certificate for `hostname`. Does not consult any cache.
    pub fn issue_leaf(&self, hostname: &str) -> CaResult<IssuedCertificate> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![subject_alt_name(hostname)?];
        params.serial_number = Some(keys::random_serial()?);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let (not_before, not_after) =
            keys::validity_window(OffsetDateTime::now_utc(), LEAF_VALIDITY)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let host_key = keys::generate_rsa_key()?;
        let key_der = keys::pkcs8_der(&host_key)?;
        let host_key_pair = keys::signing_key_pair(&key_der)?;
        let host_cert = params
            .signed_by(&host_key_pair, &self.issuer)
            .map_err(CaError::Signing)?;

        let chain = vec![host_cert.der().clone()];
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&PrivateKeyDer::from(key_der.clone_key()))
                .map_err(CaError::SigningKey)?;

        debug!("issued leaf certificate for {}", hostname);

        Ok(IssuedCertificate {
            certified_key: Arc::new(CertifiedKey::new(chain.clone(), signing_key)),
            chain,
            key_der,
        })
    }
}

fn subject_alt_name(hostname: &str) -> CaResult<SanType> {
    if hostname.is_empty() {
        return Err(CaError::InvalidHostname(hostname.to_string()));
    }
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = hostname
        .try_into()
        .map_err(|_| CaError::InvalidHostname(hostname.to_string()))?;
    Ok(SanType::DnsName(name))
}

/// Cache for leaf certificates.
///
/// Entries are created on first request and kept for the process lifetime.
/// Two concurrent first requests for the same hostname may both sign a
/// certificate; the later insert wins and both callers get a valid pair.
pub struct CertCache {
    ca: Arc<CertificateAuthority>,
    cache: RwLock<HashMap<String, Arc<IssuedCertificate>>>,
}

impl CertCache {
    /// Creates a new certificate cache backed by the given CA.
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached certificate for `hostname`, if any.
    pub fn get(&self, hostname: &str) -> Option<Arc<IssuedCertificate>> {
        self.read().get(hostname).map(Arc::clone)
    }

    /// Returns the certificate for `hostname`, signing and caching a new one on a miss.
    pub fn issue(&self, hostname: &str) -> CaResult<Arc<IssuedCertificate>> {
        if let Some(issued) = self.get(hostname) {
            return Ok(issued);
        }

        let issued = Arc::new(self.ca.issue_leaf(hostname)?);

        self.write().insert(hostname.to_string(), Arc::clone(&issued));

        Ok(issued)
    }

    /// Returns the number of cached hostnames.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a reference to the underlying CA.
    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    // Entries are inserted whole, so a panic in another holder of the lock
    // cannot leave the map half-written.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<IssuedCertificate>>> {
        self.cache.read().unwrap_or_else(|poisoned| {
            warn!("certificate cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<IssuedCertificate>>> {
        self.cache.write().unwrap_or_else(|poisoned| {
            warn!("certificate cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
