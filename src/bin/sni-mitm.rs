use anyhow::{Context, Result, bail};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use sni_mitm::{Config, DnsConfig, DnsOverride, RootAuthority};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Transparent TLS-intercepting proxy.
///
/// Terminates TLS for any hostname with certificates minted from a local
/// root authority and relays the traffic to the real server.
#[derive(Parser, Debug)]
#[command(name = "sni-mitm")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address of the interception listener [default: 0.0.0.0:443].
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Root certificate file (DER or PEM).
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Root private key file (DER or PEM).
    #[arg(long)]
    ca_key: Option<PathBuf>,

    /// Generate a new root pair, write it to --ca-cert and --ca-key, and exit.
    #[arg(long)]
    gen_ca: bool,

    /// Address of the DNS responder (UDP and TCP).
    #[arg(long)]
    dns_addr: Option<SocketAddr>,

    /// Upstream resolver for names without an override.
    #[arg(long)]
    dns_upstream: Option<SocketAddr>,

    /// Answer NAME and its subdomains with IP. May be repeated.
    #[arg(long = "dns-override", value_name = "NAME=IP")]
    dns_overrides: Vec<DnsOverride>,

    /// Log every relayed chunk.
    #[arg(long)]
    log_traffic: bool,

    /// Do not color traffic log lines.
    #[arg(long)]
    no_color: bool,
}

impl Args {
    /// Overrides config file values with command-line flags.
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(addr) = self.bind_addr {
            config.listen = addr;
        }
        if let Some(cert) = &self.ca_cert {
            config.ca.cert = Some(cert.clone());
        }
        if let Some(key) = &self.ca_key {
            config.ca.key = Some(key.clone());
        }
        if let Some(addr) = self.dns_addr {
            config
                .dns
                .get_or_insert_with(|| DnsConfig::new(addr))
                .listen = addr;
        }
        if self.dns_upstream.is_some() || !self.dns_overrides.is_empty() {
            let Some(dns) = config.dns.as_mut() else {
                bail!("--dns-upstream and --dns-override require a DNS listen address");
            };
            if let Some(upstream) = self.dns_upstream {
                dns.upstream = Some(upstream);
            }
            dns.overrides.extend(self.dns_overrides.iter().cloned());
        }
        if self.log_traffic {
            config.traffic_log.enabled = true;
        }
        if self.no_color {
            config.traffic_log.color = false;
        }

        config.normalize();
        config.validate()?;
        Ok(())
    }
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(config_path) => Config::load(config_path)
            .with_context(|| format!("failed to load config from {:?}", config_path))?,
        None => Config::default(),
    };
    args.apply(&mut config)?;

    let (cert_path, key_path) = match config.root_paths() {
        Ok(paths) => paths,
        Err(e) => Args::command()
            .error(ErrorKind::MissingRequiredArgument, e)
            .exit(),
    };

    if args.gen_ca {
        return generate_root(cert_path, key_path);
    }

    let root = RootAuthority::load(cert_path, key_path)
        .context("failed to load root certificate and key")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(sni_mitm::run(&config, &root, shutdown_signal()))
}

fn generate_root(cert_path: &Path, key_path: &Path) -> Result<()> {
    let root = RootAuthority::generate().context("failed to generate root pair")?;
    root.save(cert_path, key_path)
        .context("failed to save root pair")?;
    info!(
        "wrote root certificate to {} and key to {}",
        cert_path.display(),
        key_path.display()
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("received ctrl-c, shutting down");
}
