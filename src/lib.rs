//! Transparent TLS-intercepting proxy.
//!
//! This crate terminates TLS connections for hostnames it does not own by
//! minting leaf certificates on demand from a local root authority, dials the
//! real destination over TLS, and relays bytes in both directions.
//!
//! # Architecture
//!
//! 1. The DNS responder answers overridden names with the proxy's address and
//!    forwards every other query to an upstream resolver
//! 2. A client connects to the interception listener and announces a name via SNI
//! 3. The certificate authority issues (or returns a cached) leaf certificate
//!    for that name
//! 4. The listener dials `<name>:<local port>` over TLS
//! 5. The relay copies bytes between both sessions until either side closes
//!
//! Clients must trust the root certificate for the handshake to succeed.
//! Upstream certificates are never verified.
//!
//! # Example
//!
//! ```no_run
//! use sni_mitm::{Config, RootAuthority};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load("sni-mitm.yaml")?;
//! let root = RootAuthority::load("ca.crt", "ca.key")?;
//! sni_mitm::run(&config, &root, async {
//!     let _ = tokio::signal::ctrl_c().await;
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
mod config;
pub mod proxy;

pub use ca::{CaError, CertCache, CertificateAuthority, IssuedCertificate, RootAuthority};
pub use config::{CaPaths, Config, ConfigError, DnsConfig, DnsOverride, TrafficLogConfig};

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use proxy::{DnsServer, ProxyServer, ProxyState};

/// Serves the interception listener, and the DNS responder when configured,
/// until `shutdown` resolves.
pub async fn run(
    config: &Config,
    root: &RootAuthority,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let ca = CertificateAuthority::new(root).context("failed to load root authority")?;

    let mut state = ProxyState::new(Arc::new(ca))
        .context("failed to create proxy state")?
        .with_upstream_hosts(config.upstream_hosts.clone());
    if let Some(observer) = config.traffic_observer() {
        state = state.with_observer(observer);
    }

    let server = ProxyServer::bind(Arc::new(state), config.listen)
        .await
        .with_context(|| format!("failed to start proxy server on {}", config.listen))?;

    let dns = match &config.dns {
        Some(dns) => {
            let settings = dns.settings()?;
            let server = DnsServer::bind(dns.listen, settings)
                .await
                .with_context(|| format!("failed to start DNS responder on {}", dns.listen))?;
            Some(server)
        }
        None => None,
    };

    server.run_until(shutdown).await;

    if let Some(dns) = dns {
        dns.shutdown().await;
    }
    info!("shut down");

    Ok(())
}
