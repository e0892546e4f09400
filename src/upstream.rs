//! Backend address and raw connection setup.

use crate::error::ProxyError;
use log::debug;
use std::io;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use url::Url;

/// The single backend every request is proxied to.
///
/// Resolved once from configuration and shared read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendTarget {
    url: Url,
    host: String,
    port: u16,
}

impl BackendTarget {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::Config(format!("Invalid proxy target {}: {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::Config(format!(
                    "Unsupported proxy target scheme: {}",
                    other
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("Proxy target {} has no host", raw)))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::Config(format!("Proxy target {} has no port", raw)))?;

        Ok(Self { url, host, port })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as dialed. IPv6 hosts keep their brackets from the URL.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path prefix of the target, without a trailing slash. Empty for `http://host:port`.
    pub fn base_path(&self) -> &str {
        self.url.path().trim_end_matches('/')
    }
}

impl std::fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Open a fresh transport connection to the backend.
///
/// No retries: a refused, unreachable or timed out connect is reported once as
/// `ProxyError::Dial`.
pub async fn dial(target: &BackendTarget, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let addr = target.authority();
    debug!("Dialing backend {}", addr);

    let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(ProxyError::Dial { addr, source }),
        Err(_) => {
            return Err(ProxyError::Dial {
                addr,
                source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            })
        }
    };

    // Tunnels carry interactive traffic
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
