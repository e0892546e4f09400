//! The listening front: accepts connections, gates every request on the build,
//! then either forwards it or tunnels it.

use crate::common::{empty_body, ProxyBody, ResponseBuilder, TlsConfig};
use crate::config::Config;
use crate::error::ProxyError;
use crate::gate::{Builder, GateDecision, RequestGate, Runner};
use crate::hijack::{HijackableIo, Hijacker, Transport};
use crate::reverse_proxy::ReverseProxy;
use crate::splice::{encode_request, forward_request, splice};
use crate::upgrade::{classify, RequestKind};
use crate::upstream::{self, BackendTarget};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Incoming};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_rustls::TlsAcceptor;

pub struct Proxy {
    gate: RequestGate,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Proxy {
    pub fn new(builder: Arc<dyn Builder>, runner: Arc<dyn Runner>) -> Self {
        Self {
            gate: RequestGate::new(builder, runner),
            accept_task: None,
            local_addr: None,
        }
    }

    /// Resolve the target, load TLS material when configured, bind and start
    /// accepting in the background. Returns once the socket is listening.
    pub async fn run(&mut self, config: &Config) -> Result<(), ProxyError> {
        if self.accept_task.is_some() {
            return Err(ProxyError::Config("Proxy is already running".to_string()));
        }

        let target = config.backend_target()?;
        let addr = config.listen_addr()?;

        let acceptor = match config.tls_paths() {
            Some((cert_path, key_path)) => {
                info!("Enabling HTTPS/TLS mode");
                debug!("Loading TLS certificate from: {}", cert_path);
                debug!("Loading TLS private key from: {}", key_path);
                let tls_config = TlsConfig::create_config(cert_path, key_path)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            None => None,
        };

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let front = Arc::new(Front {
            gate: self.gate.clone(),
            forwarder: ReverseProxy::new(target.clone(), connect_timeout, config.pool_max_idle_per_host),
            target,
            connect_timeout,
        });

        info!("Binding TCP listener to: {}", addr);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let scheme = if acceptor.is_some() { "https" } else { "http" };
        info!("Proxy listening on: {}://{} -> {}", scheme, local_addr, front.target);

        self.local_addr = Some(local_addr);
        self.accept_task = Some(tokio::spawn(accept_loop(listener, acceptor, front)));
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting and release the listening socket. Connections already
    /// accepted keep running until they finish on their own.
    pub fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            info!("Proxy stopped accepting connections");
        }
        self.local_addr = None;
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(listener: TcpListener, acceptor: Option<TlsAcceptor>, front: Arc<Front>) {
    loop {
        let (tcp_stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        debug!("Connection accepted from: {}", remote_addr);

        let front = Arc::clone(&front);
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(tcp_stream).await {
                    Ok(tls_stream) => front.serve_connection(tls_stream, remote_addr).await,
                    Err(e) => warn!("TLS handshake failed from {}: {}", remote_addr, e),
                },
                None => front.serve_connection(tcp_stream, remote_addr).await,
            }
        });
    }
}

/// Per-process request handling state, shared read-only by all connections.
struct Front {
    gate: RequestGate,
    forwarder: ReverseProxy,
    target: BackendTarget,
    connect_timeout: Duration,
}

impl Front {
    async fn serve_connection<T: Transport>(self: Arc<Self>, transport: T, remote_addr: SocketAddr) {
        let (io, hijacker) = HijackableIo::new(transport);
        let probe = hijacker.clone();

        let service = service_fn(move |mut req: Request<Incoming>| {
            let front = Arc::clone(&self);
            req.extensions_mut().insert(hijacker.clone());
            async move { Ok::<_, Infallible>(front.handle(req, remote_addr).await) }
        });

        let result = ServerBuilder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(io), service)
            .await;

        match result {
            Ok(()) => debug!("Connection from {} closed", remote_addr),
            Err(_) if probe.is_hijacked() => debug!("Connection from {} handed over to tunnel", remote_addr),
            Err(e) => warn!("Error serving connection from {}: {}", remote_addr, e),
        }
    }

    async fn handle(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        if let GateDecision::Rejected(report) = self.gate.admit().await {
            return ResponseBuilder::build_failed(report);
        }

        let kind = classify(req.headers());
        debug!("{} {} from {} classified as {:?}", req.method(), req.uri(), remote_addr, kind);

        match kind {
            RequestKind::Ordinary => match self.forwarder.forward(req, Some(remote_addr.ip())).await {
                Ok(response) => response,
                Err(e) => {
                    error!("Proxy error for {}: {}", remote_addr, e);
                    ResponseBuilder::bad_gateway()
                }
            },
            RequestKind::Streaming => match self.open_tunnel(req).await {
                // Nothing reaches the client: hyper lost the connection to the tunnel
                Ok(()) => Response::new(empty_body()),
                Err(e) => {
                    error!("Streaming request from {} failed: {}", remote_addr, e);
                    match e {
                        ProxyError::NotHijackable => ResponseBuilder::not_hijackable(),
                        _ => ResponseBuilder::backend_unreachable(),
                    }
                }
            },
        }
    }

    /// Capability check, dial, take over the client connection, then replay
    /// the request and splice in a task that owns both connections.
    async fn open_tunnel(&self, req: Request<Incoming>) -> Result<(), ProxyError> {
        let hijacker = req
            .extensions()
            .get::<Hijacker>()
            .filter(|h| h.is_hijackable())
            .cloned()
            .ok_or(ProxyError::NotHijackable)?;

        let (parts, body) = req.into_parts();
        let body = if body.is_end_stream() {
            Bytes::new()
        } else {
            body.collect()
                .await
                .map_err(|e| ProxyError::Hyper(e.to_string()))?
                .to_bytes()
        };
        let request = encode_request(&parts, &body);

        let mut backend = upstream::dial(&self.target, self.connect_timeout).await?;
        let client = hijacker.hijack()?;
        let uri = parts.uri;
        debug!("Hijacked connection for {} {}", parts.method, uri);

        // Detached from hyper so the tunnel outlives the abandoned HTTP connection
        tokio::spawn(async move {
            if let Err(e) = forward_request(&mut backend, &request).await {
                warn!("{}", e);
                return;
            }
            splice(client, backend).await;
            debug!("Tunnel for {} closed", uri);
        });

        Ok(())
    }
}
