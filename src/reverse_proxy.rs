use crate::common::ProxyBody;
use crate::error::ProxyError;
use crate::upstream::BackendTarget;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::debug;
use std::net::IpAddr;
use tokio::time::Duration;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// Connection-scoped headers that must not cross the proxy
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Single-host forwarder for ordinary (non-streaming) requests.
pub struct ReverseProxy {
    client: Client<HttpsConnector<HttpConnector>, Incoming>,
    target: BackendTarget,
}

impl ReverseProxy {
    pub fn new(target: BackendTarget, connect_timeout: Duration, pool_max_idle_per_host: usize) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(connect_timeout));
        http.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build(HttpsConnector::new_with_connector(http));

        Self { client, target }
    }

    /// Forward to the backend and hand its response back with only hop-by-hop
    /// headers stripped. Status, remaining headers and body pass through as-is.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_ip: Option<IpAddr>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let target_uri = build_target_uri(&self.target, req.uri())?;
        debug!("Forwarding {} {} -> {}", req.method(), req.uri(), target_uri);

        modify_request(&mut req, target_uri, &self.target, client_ip);

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::Http(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Backend scheme and authority, backend base path joined with the request
/// path, and both query strings merged.
pub fn build_target_uri(target: &BackendTarget, incoming: &Uri) -> Result<Uri, ProxyError> {
    let path = incoming.path();
    let joined_path = match (target.base_path(), path.starts_with('/')) {
        ("", _) => path.to_string(),
        (base, true) => format!("{}{}", base, path),
        (base, false) => format!("{}/{}", base, path),
    };

    let query = match (target.url().query(), incoming.query()) {
        (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
        (Some(a), _) if !a.is_empty() => Some(a.to_string()),
        (_, Some(b)) if !b.is_empty() => Some(b.to_string()),
        _ => None,
    };

    let mut uri = format!("{}://{}{}", target.scheme(), target.authority(), joined_path);
    if let Some(query) = query {
        uri.push('?');
        uri.push_str(&query);
    }

    uri.parse::<Uri>()
        .map_err(|e| ProxyError::Http(format!("Invalid target URI {}: {}", uri, e)))
}

/// Point the request at the backend. The client's `Host` header is preserved;
/// only the request target changes.
pub fn modify_request<B>(req: &mut Request<B>, target_uri: Uri, target: &BackendTarget, client_ip: Option<IpAddr>) {
    *req.uri_mut() = target_uri;
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    remove_hop_by_hop(headers);

    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&target.authority()) {
            headers.insert(HOST, value);
        }
    }

    if let Some(ip) = client_ip {
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }
}

pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Method;

    fn target(raw: &str) -> BackendTarget {
        BackendTarget::parse(raw).unwrap()
    }

    #[test]
    fn test_target_uri_building() {
        let uri: Uri = "/api/users?page=2".parse().unwrap();
        let built = build_target_uri(&target("http://backend.example.com:3001"), &uri).unwrap();
        assert_eq!(built.to_string(), "http://backend.example.com:3001/api/users?page=2");
    }

    #[test]
    fn test_target_uri_joins_base_path_and_query() {
        let uri: Uri = "/users?page=2".parse().unwrap();
        let built = build_target_uri(&target("http://localhost:3001/v1/?key=abc"), &uri).unwrap();
        assert_eq!(built.to_string(), "http://localhost:3001/v1/users?key=abc&page=2");
    }

    #[test]
    fn test_modify_request_keeps_host_and_strips_hop_by_hop() {
        let backend = target("http://127.0.0.1:3001");
        let mut req = Request::builder()
            .method(Method::GET)
            .uri("/index")
            .header(HOST, "localhost:3000")
            .header(CONNECTION, "keep-alive, x-session-hint")
            .header("x-session-hint", "1")
            .header("keep-alive", "timeout=5")
            .header("accept", "text/html")
            .body(())
            .unwrap();

        let uri = build_target_uri(&backend, req.uri()).unwrap();
        modify_request(&mut req, uri, &backend, Some("10.0.0.7".parse().unwrap()));

        assert_eq!(req.uri().to_string(), "http://127.0.0.1:3001/index");
        assert_eq!(req.headers()[HOST], "localhost:3000");
        assert_eq!(req.headers()["accept"], "text/html");
        assert_eq!(req.headers()["x-forwarded-for"], "10.0.0.7");
        assert!(!req.headers().contains_key(CONNECTION));
        assert!(!req.headers().contains_key("keep-alive"));
        assert!(!req.headers().contains_key("x-session-hint"));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let backend = target("http://127.0.0.1:3001");
        let mut req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "192.168.1.1")
            .body(())
            .unwrap();
        let uri = build_target_uri(&backend, req.uri()).unwrap();
        modify_request(&mut req, uri, &backend, Some("127.0.0.1".parse().unwrap()));

        assert_eq!(req.headers()["x-forwarded-for"], "192.168.1.1, 127.0.0.1");
        // HTTP/1.0 style request without Host gets the backend authority
        assert_eq!(req.headers()[HOST], "127.0.0.1:3001");
    }
}
