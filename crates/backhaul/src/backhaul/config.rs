use std::{fmt, path::PathBuf, str::FromStr};

use anyhow::Context;
use serde::Deserialize;

/// Tunnels per mapping are clamped into this range.
pub const MIN_TUNNEL_COUNT: usize = 1;
pub const MAX_TUNNEL_COUNT: usize = 10;

/// A `HOST:PORT` or `HOST:PORT:PORT2` endpoint.
///
/// `port` is the primary port (the private-service port in a proxy mapping);
/// `port2` is the requested public broker-side port and defaults to `port`
/// when the second port is not given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub host: String,
    pub port: u16,
    pub port2: u16,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: u16, port2: u16) -> Self {
        Self {
            host: host.into(),
            port,
            port2,
        }
    }

    /// `host:port`, the dialable form.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.port2)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("address {0:?} is not HOST:PORT or HOST:PORT:PORT2")]
    BadShape(String),
    #[error("address {0:?} has an empty host")]
    EmptyHost(String),
    #[error("address {addr:?} has an invalid port {port:?}")]
    BadPort { addr: String, port: String },
}

impl FromStr for NetAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(AddressParseError::BadShape(s.to_string()));
        }

        let host = parts[0].trim();
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(s.to_string()));
        }

        let port = parse_port(s, parts[1])?;
        let port2 = if parts.len() == 3 {
            parse_port(s, parts[2])?
        } else {
            port
        };

        Ok(NetAddress::new(host, port, port2))
    }
}

fn parse_port(addr: &str, raw: &str) -> Result<u16, AddressParseError> {
    let raw = raw.trim();
    match raw.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(AddressParseError::BadPort {
            addr: addr.to_string(),
            port: raw.to_string(),
        }),
    }
}

/// Parse a comma-separated mapping list, e.g.
/// `127.0.0.1:3306:13306,127.0.0.1:6379:16379`.
pub fn parse_net_addresses(list: &str) -> Result<Vec<NetAddress>, AddressParseError> {
    list.split(',').map(|a| a.parse()).collect()
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub key: String,
    /// Control port the broker listens on for tunnel sessions.
    pub port: u16,
    pub min_proxy_port: u16,
    pub max_proxy_port: u16,
}

impl ServerConfig {
    /// Public ports are legal strictly between the bounds, excluding both.
    pub fn port_in_range(&self, port: u32) -> bool {
        port > u32::from(self.min_proxy_port) && port < u32::from(self.max_proxy_port)
    }

    fn validate(self) -> anyhow::Result<Self> {
        if self.key.trim().is_empty() {
            anyhow::bail!("config: server key is empty");
        }
        if self.port == 0 {
            anyhow::bail!("config: server port must be in 1..=65535");
        }
        if self.min_proxy_port == 0 || self.max_proxy_port == 0 {
            anyhow::bail!("config: proxy port bounds must be in 1..=65535");
        }
        if self.max_proxy_port.saturating_sub(self.min_proxy_port) < 2 {
            anyhow::bail!(
                "config: proxy port range {}-{} leaves no usable port",
                self.min_proxy_port,
                self.max_proxy_port
            );
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub key: String,
    pub server_addr: NetAddress,
    /// Private-service endpoints and their requested public ports.
    pub proxy_addrs: Vec<NetAddress>,
    pub tunnel_count: usize,
}

impl ClientConfig {
    fn validate(mut self) -> anyhow::Result<Self> {
        if self.key.trim().is_empty() {
            anyhow::bail!("config: client key is empty");
        }
        if self.proxy_addrs.is_empty() {
            anyhow::bail!("config: no proxy mappings configured");
        }
        self.tunnel_count = self.tunnel_count.clamp(MIN_TUNNEL_COUNT, MAX_TUNNEL_COUNT);
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
        }
    }
}

/// `server KEY PORT MIN-MAX`
pub fn server_config_from_args(args: &[String]) -> anyhow::Result<ServerConfig> {
    if args.len() < 3 {
        anyhow::bail!("usage: server <key> <port> <min-max>");
    }

    let key = args[0].trim().to_string();
    let port: u16 = args[1]
        .trim()
        .parse()
        .with_context(|| format!("config: bad control port {:?}", args[1]))?;

    let (min, max) = args[2]
        .trim()
        .split_once('-')
        .with_context(|| format!("config: bad port range {:?} (expected MIN-MAX)", args[2]))?;
    let min_proxy_port: u16 = min
        .trim()
        .parse()
        .with_context(|| format!("config: bad minimum proxy port {min:?}"))?;
    let max_proxy_port: u16 = max
        .trim()
        .parse()
        .with_context(|| format!("config: bad maximum proxy port {max:?}"))?;

    ServerConfig {
        key,
        port,
        min_proxy_port,
        max_proxy_port,
    }
    .validate()
}

/// `client KEY SERVER:PORT MAPPING[,MAPPING...] [TUNNEL_COUNT]`
pub fn client_config_from_args(args: &[String]) -> anyhow::Result<ClientConfig> {
    if args.len() < 3 {
        anyhow::bail!(
            "usage: client <key> <server:port> <local:port:public>[,...] [tunnel-count]"
        );
    }

    let key = args[0].trim().to_string();
    let server_addr: NetAddress = args[1]
        .parse()
        .with_context(|| format!("config: bad server address {:?}", args[1]))?;
    let proxy_addrs = parse_net_addresses(&args[2])
        .with_context(|| format!("config: bad proxy mappings {:?}", args[2]))?;

    let tunnel_count = match args.get(3) {
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .with_context(|| format!("config: bad tunnel count {raw:?}"))?,
        None => MIN_TUNNEL_COUNT,
    };

    ClientConfig {
        key,
        server_addr,
        proxy_addrs,
        tunnel_count,
    }
    .validate()
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    server: Option<FileServer>,
    client: Option<FileClient>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
struct FileServer {
    key: String,
    port: u16,
    #[serde(rename = "min-proxy-port")]
    min_proxy_port: u16,
    #[serde(rename = "max-proxy-port")]
    max_proxy_port: u16,
    #[serde(rename = "cert-file", default)]
    cert_file: String,
    #[serde(rename = "key-file", default)]
    key_file: String,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    key: String,
    #[serde(rename = "server-addr")]
    server_addr: String,
    #[serde(rename = "proxy-mappings")]
    proxy_mappings: Vec<String>,
    #[serde(rename = "tunnel-count", default)]
    tunnel_count: usize,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
}

/// Everything `config.yml` can carry; each mode picks its section.
#[derive(Debug)]
pub struct FileSettings {
    server: Option<FileServer>,
    client: Option<FileClient>,
    pub logging: LoggingConfig,
}

impl FileSettings {
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let s = self
            .server
            .as_ref()
            .context("config: config.yml has no `server` section")?;
        ServerConfig {
            key: s.key.trim().to_string(),
            port: s.port,
            min_proxy_port: s.min_proxy_port,
            max_proxy_port: s.max_proxy_port,
        }
        .validate()
    }

    /// PEM paths for the broker's QUIC certificate; both empty means
    /// "generate a self-signed one".
    pub fn server_cert_files(&self) -> (String, String) {
        match &self.server {
            Some(s) => (s.cert_file.trim().to_string(), s.key_file.trim().to_string()),
            None => (String::new(), String::new()),
        }
    }

    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let c = self
            .client
            .as_ref()
            .context("config: config.yml has no `client` section")?;

        let server_addr: NetAddress = c
            .server_addr
            .parse()
            .with_context(|| format!("config: bad server-addr {:?}", c.server_addr))?;

        let mut proxy_addrs = Vec::with_capacity(c.proxy_mappings.len());
        for m in &c.proxy_mappings {
            let addr: NetAddress = m
                .parse()
                .with_context(|| format!("config: bad proxy mapping {m:?}"))?;
            proxy_addrs.push(addr);
        }

        ClientConfig {
            key: c.key.trim().to_string(),
            server_addr,
            proxy_addrs,
            tunnel_count: if c.tunnel_count == 0 {
                MIN_TUNNEL_COUNT
            } else {
                c.tunnel_count
            },
        }
        .validate()
    }
}

/// Load `config.yml` from the executable's directory, falling back to the
/// current working directory.
pub fn load_file_settings() -> anyhow::Result<FileSettings> {
    let path = discover_config_path().context("config: no config.yml found")?;
    let data = std::fs::read_to_string(&path)
        .with_context(|| format!("config: read {}", path.display()))?;
    let fc: FileConfig =
        serde_yaml::from_str(&data).with_context(|| format!("config: parse {}", path.display()))?;

    let mut logging = LoggingConfig::default();
    if let Some(l) = fc.logging {
        if let Some(v) = l.level {
            logging.level = v;
        }
        if let Some(v) = l.format {
            logging.format = v;
        }
        if let Some(v) = l.output {
            logging.output = v;
        }
    }

    Ok(FileSettings {
        server: fc.server,
        client: fc.client,
        logging,
    })
}

fn discover_config_path() -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            dirs.push(dir.to_path_buf());
        }
    }
    dirs.push(PathBuf::from("."));

    for dir in dirs {
        for name in ["config.yml", "config.yaml"] {
            let p = dir.join(name);
            if p.is_file() {
                return Some(p);
            }
        }
    }
    None
}
