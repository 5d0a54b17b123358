//! Reading and persisting root material.
//!
//! Certificates and keys are accepted either as raw DER or as PEM (anything
//! starting with `-----`). Keys are RSA, PKCS#1 or PKCS#8.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use rsa::RsaPrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::der::pem;
use rsa::pkcs8::{DecodePrivateKey, LineEnding};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use super::generator::{CaError, CaResult, RootAuthority};

const PEM_PREFIX: &[u8] = b"-----";

fn is_pem(bytes: &[u8]) -> bool {
    bytes.starts_with(PEM_PREFIX)
}

fn read_file(path: &Path) -> CaResult<Vec<u8>> {
    fs::read(path).map_err(|source| CaError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads a certificate from a DER or PEM file.
pub fn load_certificate(path: impl AsRef<Path>) -> CaResult<CertificateDer<'static>> {
    let path = path.as_ref();
    let bytes = read_file(path)?;
    if !is_pem(&bytes) {
        return Ok(CertificateDer::from(bytes));
    }
    rustls_pemfile::certs(&mut bytes.as_slice())
        .next()
        .and_then(Result::ok)
        .ok_or_else(|| CaError::Pem(path.to_path_buf()))
}

/// Loads an RSA private key from a DER or PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> CaResult<RsaPrivateKey> {
    let path = path.as_ref();
    let bytes = read_file(path)?;
    if !is_pem(&bytes) {
        return RsaPrivateKey::from_pkcs1_der(&bytes)
            .or_else(|_| RsaPrivateKey::from_pkcs8_der(&bytes))
            .map_err(|_| CaError::UnsupportedKey(path.to_path_buf()));
    }
    let key = rustls_pemfile::private_key(&mut bytes.as_slice())
        .ok()
        .flatten()
        .ok_or_else(|| CaError::Pem(path.to_path_buf()))?;
    let parsed = match &key {
        PrivateKeyDer::Pkcs1(der) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der()).ok(),
        PrivateKeyDer::Pkcs8(der) => RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der()).ok(),
        _ => None,
    };
    parsed.ok_or_else(|| CaError::UnsupportedKey(path.to_path_buf()))
}

impl RootAuthority {
    /// Loads a root pair from certificate and key files.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> CaResult<Self> {
        let cert = load_certificate(cert_path.as_ref())?;
        let key = load_private_key(key_path.as_ref())?;
        debug!(
            "loaded root material from {} and {}",
            cert_path.as_ref().display(),
            key_path.as_ref().display()
        );
        Ok(Self::from_parts(cert, key))
    }

    /// Returns the root certificate as PEM.
    pub fn cert_pem(&self) -> CaResult<String> {
        pem::encode_string("CERTIFICATE", LineEnding::LF, self.cert_der())
            .map_err(|_| CaError::KeySerialization)
    }

    /// Returns the root key as a PKCS#1 `RSA PRIVATE KEY` PEM block.
    pub fn key_pem(&self) -> CaResult<String> {
        self.key()
            .to_pkcs1_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|_| CaError::KeySerialization)
    }

    /// Writes the certificate and key as PEM. Existing files are never overwritten.
    pub fn save(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> CaResult<()> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        for path in [cert_path, key_path] {
            if path.exists() {
                return Err(CaError::AlreadyExists(path.to_path_buf()));
            }
        }
        write_new(cert_path, self.cert_pem()?.as_bytes(), 0o644)?;
        write_new(key_path, self.key_pem()?.as_bytes(), 0o600)?;
        debug!(
            "saved root material to {} and {}",
            cert_path.display(),
            key_path.display()
        );
        Ok(())
    }
}

fn write_new(path: &Path, contents: &[u8], mode: u32) -> CaResult<()> {
    let io_error = |source| CaError::Io {
        path: PathBuf::from(path),
        source,
    };
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::AlreadyExists => CaError::AlreadyExists(path.to_path_buf()),
        _ => io_error(e),
    })?;
    file.write_all(contents).map_err(io_error)
}
