use crate::error::ProxyError;
use crate::upstream::BackendTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// Listen host used when none is configured. Keeps the dev proxy off the network
/// unless explicitly asked for.
pub const DEFAULT_LADDR: &str = "127.0.0.1";

fn default_port() -> u16 {
    3000
}

fn default_proxy_to() -> String {
    "http://localhost:3001".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_settle_ms() -> u64 {
    250
}

fn default_watch_debounce() -> u64 {
    500
}

fn default_watch_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

fn default_ignore() -> Vec<String> {
    vec!["target".to_string(), "node_modules".to_string()]
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// Command that compiles or prepares the backend.
/// No command means there is nothing to build (interpreted backends).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Backend process started and restarted by the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Pause after starting the backend so it can bind its port (milliseconds)
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: "./app".to_string(),
            args: Vec::new(),
            dir: None,
            env: HashMap::new(),
            settle_ms: default_settle_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_watch_paths")]
    pub paths: Vec<PathBuf>,
    /// File extensions that trigger a rebuild, without the dot. Empty watches every file.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Directory names whose contents never trigger a rebuild. Hidden entries are always skipped.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    /// Quiet period after a change before rebuilding, so a burst of writes builds once (milliseconds)
    #[serde(default = "default_watch_debounce")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            paths: default_watch_paths(),
            extensions: Vec::new(),
            ignore: default_ignore(),
            debounce_ms: default_watch_debounce(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub laddr: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_proxy_to")]
    pub proxy_to: String,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            laddr: None,
            port: default_port(),
            proxy_to: default_proxy_to(),
            cert_file: None,
            key_file: None,
            connect_timeout_secs: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            build: BuildConfig::default(),
            run: RunConfig::default(),
            watch: WatchConfig::default(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Listen host, falling back to loopback when unset or blank.
    pub fn listen_host(&self) -> &str {
        match self.laddr.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => host,
            _ => DEFAULT_LADDR,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        let host = self.listen_host();
        // Bracket bare IPv6 literals so "host:port" stays parseable
        let joined = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        };

        joined
            .to_socket_addrs()
            .map_err(|e| ProxyError::Config(format!("Invalid listen address {}: {}", joined, e)))?
            .next()
            .ok_or_else(|| ProxyError::Config(format!("Listen address {} did not resolve", joined)))
    }

    pub fn backend_target(&self) -> Result<BackendTarget, ProxyError> {
        BackendTarget::parse(&self.proxy_to)
    }

    /// TLS material, only when both halves of the pair are configured.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (self.cert_file.as_deref(), self.key_file.as_deref()) {
            (Some(cert), Some(key)) if !cert.is_empty() && !key.is_empty() => Some((cert, key)),
            _ => None,
        }
    }
}
