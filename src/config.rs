use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::proxy::{DnsSettings, OverrideTable, TracingObserver, TrafficObserver, fqdn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid DNS override: {0}")]
    InvalidOverride(String),
    #[error("DNS responder on {0} has no upstream resolver")]
    MissingUpstream(SocketAddr),
    #[error("root certificate and key paths are required unless generating a new root pair")]
    MissingRootMaterial,
}

/// Paths of the root certificate and private key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaPaths {
    #[serde(default)]
    pub cert: Option<PathBuf>,
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// Traffic logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLogConfig {
    /// Log every relayed chunk.
    #[serde(default)]
    pub enabled: bool,
    /// Color-tag log lines by direction.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_color() -> bool {
    true
}

impl Default for TrafficLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            color: default_color(),
        }
    }
}

/// One DNS override: queries for `name` and its subdomains resolve to `address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsOverride {
    pub name: String,
    pub address: Ipv4Addr,
}

impl FromStr for DnsOverride {
    type Err = ConfigError;

    /// Parses `NAME=IP`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, address) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidOverride(format!("{s}: expected NAME=IP")))?;
        let address = address
            .parse()
            .map_err(|_| ConfigError::InvalidOverride(format!("{s}: invalid IPv4 address")))?;
        let rule = Self {
            name: name.to_string(),
            address,
        };
        rule.validate()?;
        Ok(rule)
    }
}

impl DnsOverride {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() || self.name == "." {
            return Err(ConfigError::InvalidOverride("empty name".to_string()));
        }
        if self.name.chars().any(|c| c.is_whitespace()) {
            return Err(ConfigError::InvalidOverride(self.name.clone()));
        }
        Ok(())
    }
}

/// DNS responder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Address for both the UDP and TCP listeners.
    pub listen: SocketAddr,
    /// Resolver for queries without an override.
    #[serde(default)]
    pub upstream: Option<SocketAddr>,
    /// Deadline for one upstream exchange, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub overrides: Vec<DnsOverride>,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl DnsConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            upstream: None,
            timeout_ms: default_timeout_ms(),
            overrides: Vec::new(),
        }
    }

    /// Builds the responder settings.
    pub fn settings(&self) -> Result<DnsSettings, ConfigError> {
        let upstream = self
            .upstream
            .ok_or(ConfigError::MissingUpstream(self.listen))?;
        Ok(DnsSettings {
            upstream,
            timeout: Duration::from_millis(self.timeout_ms),
            overrides: OverrideTable::new(
                self.overrides
                    .iter()
                    .map(|rule| (rule.name.clone(), rule.address)),
            ),
        })
    }
}

/// Proxy configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the interception listener.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Root certificate and key.
    #[serde(default)]
    pub ca: CaPaths,

    /// Traffic logging settings.
    #[serde(default)]
    pub traffic_log: TrafficLogConfig,

    /// Hosts dialed at a fixed address instead of through the system resolver.
    #[serde(default)]
    pub upstream_hosts: HashMap<String, IpAddr>,

    /// DNS responder settings. The responder is not started when absent.
    #[serde(default)]
    pub dns: Option<DnsConfig>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 443)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ca: CaPaths::default(),
            traffic_log: TrafficLogConfig::default(),
            upstream_hosts: HashMap::new(),
            dns: None,
        }
    }
}

impl Config {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Rewrites override names into dot-terminated form.
    pub fn normalize(&mut self) {
        if let Some(dns) = &mut self.dns {
            for rule in &mut dns.overrides {
                rule.name = fqdn(&rule.name);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dns) = &self.dns {
            if dns.upstream.is_none() {
                return Err(ConfigError::MissingUpstream(dns.listen));
            }
            for rule in &dns.overrides {
                rule.validate()?;
            }
        }
        Ok(())
    }

    /// Returns the root certificate and key paths.
    pub fn root_paths(&self) -> Result<(&Path, &Path), ConfigError> {
        match (&self.ca.cert, &self.ca.key) {
            (Some(cert), Some(key)) => Ok((cert.as_path(), key.as_path())),
            _ => Err(ConfigError::MissingRootMaterial),
        }
    }

    /// Returns the traffic observer when traffic logging is enabled.
    pub fn traffic_observer(&self) -> Option<Arc<dyn TrafficObserver>> {
        if !self.traffic_log.enabled {
            return None;
        }
        Some(Arc::new(TracingObserver::new(self.traffic_log.color)))
    }
}
