use crate::error::ProxyError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;

/// Response body shared by forwarded and locally generated responses.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Locally generated responses
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Build failure page: the report verbatim as the whole body
    pub fn build_failed(report: String) -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, report)
    }

    /// Streaming backend could not be reached
    pub fn backend_unreachable() -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "Error contacting backend server.")
    }

    pub fn not_hijackable() -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "Connection does not support raw takeover.")
    }

    pub fn bad_gateway() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }

    pub fn error(status: StatusCode, message: impl Into<Bytes>) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}

pub struct TlsConfig;

impl TlsConfig {
    /// Load a certificate chain and private key (PEM) into a rustls server config.
    /// Any failure here is fatal to startup.
    pub fn create_config(cert_path: &str, private_key_path: &str) -> Result<ServerConfig, ProxyError> {
        let mut cert_file = BufReader::new(
            File::open(cert_path)
                .map_err(|e| ProxyError::Config(format!("Failed to open certificate file: {}", e)))?,
        );

        let mut private_key_file = BufReader::new(
            File::open(private_key_path)
                .map_err(|e| ProxyError::Config(format!("Failed to open private key file: {}", e)))?,
        );

        let certs = rustls_pemfile::certs(&mut cert_file)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ProxyError::Config(format!("Failed to read certificate: {}", e)))?;

        if certs.is_empty() {
            return Err(ProxyError::Config("No valid certificate found".to_string()));
        }

        // PKCS#8, PKCS#1 or SEC1, whichever comes first
        let private_key = rustls_pemfile::private_key(&mut private_key_file)
            .map_err(|e| ProxyError::Config(format!("Failed to read private key: {}", e)))?
            .ok_or_else(|| ProxyError::Config("No valid private key found".to_string()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))?;

        // Hijacked tunnels speak raw HTTP/1 bytes
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }
}
