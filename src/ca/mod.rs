//! Root authority and on-demand leaf certificates for TLS interception.
//!
//! This module provides root pair generation and loading, leaf signing, and
//! per-hostname certificate caching.

mod generator;
pub mod keys;
pub mod material;

pub use generator::{
    CaError, CaResult, CertCache, CertificateAuthority, IssuedCertificate, ROOT_COMMON_NAME,
    RootAuthority,
};
