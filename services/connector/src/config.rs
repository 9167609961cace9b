//! Connector configuration.
//!
//! Sources, highest precedence first:
//! 1. Command-line flags (each also readable from an `EDGELINK_*` variable)
//! 2. The config file named by `--config` (YAML, TOML, or JSON by extension)
//! 3. Built-in defaults
//!
//! Ingress comes from exactly one place: `--hello-world`, `--url`, or the
//! file's `ingress` list. With none of them, every request gets 503.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use edgelink_id::{ConnIndex, TunnelId};
use serde::Deserialize;

use crate::error::{ConfigError, IngressError};
use crate::proxy::{Ingress, RuleConfig, UpstreamTarget};
use crate::tunnel::{EdgeTls, TunnelSettings};

pub const DEFAULT_EDGE_ADDR: &str = "127.0.0.1:7844";
pub const DEFAULT_HA_CONNECTIONS: usize = 4;
pub const DEFAULT_METRICS_ADDR: &str = "127.0.0.1:20241";
pub const DEFAULT_MANAGEMENT_ADDR: &str = "127.0.0.1:20242";
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 30;
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Command-line flags.
#[derive(Parser, Debug, Default)]
#[command(name = "connector")]
#[command(version, about = "Edgelink tunnel connector")]
pub struct Args {
    /// Config file (YAML, TOML, or JSON)
    #[arg(long, env = "EDGELINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Edge address to dial (host:port, or an http:// or https:// URL)
    #[arg(long, env = "EDGELINK_EDGE")]
    pub edge: Option<String>,

    /// CA certificate (PEM) that signs the edge certificate. Enables TLS.
    #[arg(long, env = "EDGELINK_EDGE_CA_CERT")]
    pub edge_ca_cert: Option<PathBuf>,

    /// Name the edge certificate is verified against (default: edge host)
    #[arg(long, env = "EDGELINK_EDGE_SERVER_NAME", requires = "edge_ca_cert")]
    pub edge_server_name: Option<String>,

    /// Tunnel to register against. A fresh one is generated when omitted.
    #[arg(long, env = "EDGELINK_TUNNEL_ID")]
    pub tunnel_id: Option<TunnelId>,

    /// Tunnel credentials presented at registration
    #[arg(long, env = "EDGELINK_CREDENTIALS", hide_env_values = true)]
    pub credentials: Option<String>,

    /// Number of HA connections to the edge
    #[arg(long, env = "EDGELINK_HA_CONNECTIONS")]
    pub ha_connections: Option<usize>,

    /// Label reported as `custom:<label>` by the management endpoint
    #[arg(long, env = "EDGELINK_LABEL")]
    pub label: Option<String>,

    /// Origin URL that receives every request
    #[arg(long, env = "EDGELINK_URL", conflicts_with = "hello_world")]
    pub url: Option<String>,

    /// Serve every request from the built-in hello-world origin
    #[arg(long, env = "EDGELINK_HELLO_WORLD")]
    pub hello_world: bool,

    /// Readiness/metrics listen address
    #[arg(long, env = "EDGELINK_METRICS")]
    pub metrics: Option<SocketAddr>,

    /// Management listen address
    #[arg(long, env = "EDGELINK_MANAGEMENT")]
    pub management: Option<SocketAddr>,

    /// Token required by the management endpoint
    #[arg(long, env = "EDGELINK_MANAGEMENT_TOKEN", hide_env_values = true)]
    pub management_token: Option<String>,

    /// Seconds in-flight requests may run after shutdown starts
    #[arg(long, env = "EDGELINK_GRACE_PERIOD")]
    pub grace_period: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "EDGELINK_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Config file contents. Keys are kebab-case.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileConfig {
    pub tunnel: Option<TunnelId>,
    pub credentials: Option<String>,
    pub edge: Option<String>,
    pub edge_ca_cert: Option<PathBuf>,
    pub edge_server_name: Option<String>,
    pub ha_connections: Option<usize>,
    pub label: Option<String>,
    pub metrics: Option<SocketAddr>,
    pub management: Option<SocketAddr>,
    pub management_token: Option<String>,
    pub grace_period: Option<u64>,
    pub upstream_timeout: Option<u64>,
    #[serde(default)]
    pub preserve_host: bool,
    pub log_level: Option<String>,
    #[serde(default)]
    pub ingress: Vec<RuleConfig>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(loaded.try_deserialize()?)
    }
}

/// Where the ingress rules come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IngressSource {
    /// No rules: every request is answered with 503.
    #[default]
    None,
    HelloWorld,
    Url(String),
    Rules(Vec<RuleConfig>),
}

impl IngressSource {
    /// Builds and validates the rule set.
    pub fn build(&self) -> Result<Ingress, IngressError> {
        match self {
            IngressSource::None => Ok(Ingress::empty()),
            IngressSource::HelloWorld => Ok(Ingress::single(UpstreamTarget::HelloWorld)),
            IngressSource::Url(url) => Ingress::from_config(&[RuleConfig {
                hostname: None,
                path: None,
                service: url.clone(),
            }]),
            IngressSource::Rules(rules) => Ingress::from_config(rules),
        }
    }
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub tunnel: TunnelSettings,
    pub ha_connections: usize,
    pub metrics_addr: SocketAddr,
    pub management_addr: SocketAddr,
    pub management_token: Option<String>,
    pub ingress: IngressSource,
    pub upstream_timeout: Duration,
    pub preserve_host: bool,
    pub log_level: String,
}

impl Config {
    /// Single connection, no ingress, local servers on ephemeral ports.
    pub fn new(edge_addr: impl Into<String>) -> Self {
        Self {
            tunnel: TunnelSettings::new(edge_addr, TunnelId::new()),
            ha_connections: 1,
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            management_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            management_token: None,
            ingress: IngressSource::None,
            upstream_timeout: Duration::from_secs(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            preserve_host: false,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }

    /// Merges flags, the config file, and defaults, then validates.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let file = args
            .config
            .as_deref()
            .map(FileConfig::load)
            .transpose()?
            .unwrap_or_default();

        let ha_connections = args
            .ha_connections
            .or(file.ha_connections)
            .unwrap_or(DEFAULT_HA_CONNECTIONS);
        if !(1..=ConnIndex::MAX_CONNECTIONS).contains(&ha_connections) {
            return Err(ConfigError::Invalid(format!(
                "ha-connections must be between 1 and {}, got {ha_connections}",
                ConnIndex::MAX_CONNECTIONS
            )));
        }

        let edge = args
            .edge
            .or(file.edge)
            .unwrap_or_else(|| DEFAULT_EDGE_ADDR.to_string());
        if edge.trim().is_empty() {
            return Err(ConfigError::Invalid("edge address is empty".to_string()));
        }

        let tunnel_id = args.tunnel_id.or(file.tunnel).unwrap_or_default();

        let mut tunnel = TunnelSettings::new(edge, tunnel_id);
        tunnel.credentials = args.credentials.or(file.credentials).unwrap_or_default();
        tunnel.label = args.label.or(file.label).filter(|l| !l.is_empty());
        tunnel.grace_period = Duration::from_secs(
            args.grace_period
                .or(file.grace_period)
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
        );
        let server_name = args.edge_server_name.or(file.edge_server_name);
        tunnel.tls = match args.edge_ca_cert.or(file.edge_ca_cert) {
            Some(path) => Some(EdgeTls {
                ca_pem: read_pem(&path)?,
                server_name,
            }),
            None if server_name.is_some() => {
                return Err(ConfigError::Invalid(
                    "edge-server-name requires edge-ca-cert".to_string(),
                ));
            }
            None => None,
        };
        tunnel
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let ingress = if args.hello_world {
            IngressSource::HelloWorld
        } else if let Some(url) = args.url {
            IngressSource::Url(url)
        } else if !file.ingress.is_empty() {
            IngressSource::Rules(file.ingress)
        } else {
            IngressSource::None
        };
        ingress.build()?;

        let config = Self {
            tunnel,
            ha_connections,
            metrics_addr: match args.metrics.or(file.metrics) {
                Some(addr) => addr,
                None => parse_default(DEFAULT_METRICS_ADDR)?,
            },
            management_addr: match args.management.or(file.management) {
                Some(addr) => addr,
                None => parse_default(DEFAULT_MANAGEMENT_ADDR)?,
            },
            management_token: args
                .management_token
                .or(file.management_token)
                .filter(|t| !t.is_empty()),
            ingress,
            upstream_timeout: Duration::from_secs(
                file.upstream_timeout
                    .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            ),
            preserve_host: file.preserve_host,
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        };

        Ok(config)
    }
}

fn read_pem(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Invalid(format!("edge CA certificate {}: {e}", path.display()))
    })
}

fn parse_default(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.parse()
        .map_err(|e| ConfigError::Invalid(format!("default address {addr}: {e}")))
}
