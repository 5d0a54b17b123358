//! Key, serial number and validity primitives shared by root and leaf issuance.

use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{KeyPair, PKCS_RSA_SHA256, SerialNumber};
use rsa::RsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls::pki_types::PrivatePkcs8KeyDer;
use time::{Duration, OffsetDateTime};

use super::generator::{CaError, CaResult};

/// RSA modulus size for every key this authority generates.
pub const RSA_BITS: usize = 2048;

/// Serial numbers are 128 bits wide.
const SERIAL_BYTES: usize = 16;

/// Root certificates are valid for three years.
pub const ROOT_VALIDITY: Duration = Duration::days(3 * 365);

/// Leaf certificates are valid for one year.
pub const LEAF_VALIDITY: Duration = Duration::days(365);

/// Generates a fresh RSA-2048 private key from the operating system RNG.
pub fn generate_rsa_key() -> CaResult<RsaPrivateKey> {
    RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(CaError::KeyGeneration)
}

/// Wraps a PKCS#8 RSA key as an rcgen signing key (RSA PKCS#1 v1.5 with SHA-256).
pub fn signing_key_pair(pkcs8: &PrivatePkcs8KeyDer<'_>) -> CaResult<KeyPair> {
    KeyPair::from_pkcs8_der_and_sign_algo(pkcs8, &PKCS_RSA_SHA256).map_err(CaError::Signing)
}

/// Encodes an RSA key as PKCS#8 DER.
pub fn pkcs8_der(key: &RsaPrivateKey) -> CaResult<PrivatePkcs8KeyDer<'static>> {
    let document = key.to_pkcs8_der().map_err(|_| CaError::KeySerialization)?;
    Ok(PrivatePkcs8KeyDer::from(document.as_bytes().to_vec()))
}

/// Draws a 128-bit serial number from the operating system RNG.
pub fn random_serial() -> CaResult<SerialNumber> {
    let mut bytes = [0u8; SERIAL_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CaError::Random(e.to_string()))?;
    Ok(SerialNumber::from_slice(&bytes))
}

/// Returns `(not_before, not_after)` for a certificate issued at `now`.
///
/// `not_before` is `now` rounded down to a multiple of `period` since the Unix
/// epoch, so every certificate minted within one period shares the same start
/// time. `not_after` is `now + period`.
pub fn validity_window(
    now: OffsetDateTime,
    period: Duration,
) -> CaResult<(OffsetDateTime, OffsetDateTime)> {
    let secs = now.unix_timestamp();
    let step = period.whole_seconds();
    if step <= 0 {
        return Err(CaError::Validity(format!("invalid validity period {period}")));
    }
    let floored = secs - secs.rem_euclid(step);
    let not_before = OffsetDateTime::from_unix_timestamp(floored)
        .map_err(|e| CaError::Validity(e.to_string()))?;
    let not_after = now
        .checked_add(period)
        .ok_or_else(|| CaError::Validity(format!("{now} + {period} overflows")))?;
    Ok((not_before, not_after))
}
