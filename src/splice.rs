//! Byte tunnel between a hijacked client connection and a backend connection.

use crate::error::ProxyError;
use crate::hijack::Transport;
use bytes::{BufMut, Bytes, BytesMut};
use hyper::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::Version;
use log::debug;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client -> backend"),
            Direction::BackendToClient => write!(f, "backend -> client"),
        }
    }
}

/// Serialize a request back into HTTP/1 wire form: request line, headers in
/// received order, blank line, body.
///
/// A non-empty body is written with an explicit `Content-Length` because it has
/// already been de-chunked.
pub fn encode_request(parts: &http::request::Parts, body: &[u8]) -> Bytes {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let version = match parts.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    let mut out = BytesMut::with_capacity(256 + body.len());
    out.put_slice(parts.method.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(target.as_bytes());
    out.put_u8(b' ');
    out.put_slice(version.as_bytes());
    out.put_slice(b"\r\n");

    for (name, value) in parts.headers.iter() {
        if !body.is_empty() && (name == CONTENT_LENGTH || name == TRANSFER_ENCODING) {
            continue;
        }
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    if !body.is_empty() {
        out.put_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);

    out.freeze()
}

/// Write the replayed request onto the backend exactly once.
pub async fn forward_request<W>(backend: &mut W, request: &[u8]) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    backend.write_all(request).await.map_err(ProxyError::Forward)?;
    backend.flush().await.map_err(ProxyError::Forward)
}

/// Copy bytes both ways until either direction ends, then close both sides.
///
/// Each direction runs as its own task and reports on a shared channel that is
/// read once. The first report ends the tunnel: both copy tasks are cancelled
/// and awaited, which drops all four halves, so each connection is closed
/// exactly once before this returns. Later errors are discarded.
pub async fn splice<A, B>(client: A, backend: B)
where
    A: Transport,
    B: Transport,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    // Room for both reports so neither task ever waits on the channel
    let (done_tx, mut done_rx) = mpsc::channel(2);

    let upstream = tokio::spawn(pump(
        Direction::ClientToBackend,
        client_read,
        backend_write,
        done_tx.clone(),
    ));
    let downstream = tokio::spawn(pump(
        Direction::BackendToClient,
        backend_read,
        client_write,
        done_tx,
    ));

    match done_rx.recv().await {
        Some((direction, Ok(bytes))) => {
            debug!("Tunnel {} finished after {} bytes, closing", direction, bytes)
        }
        Some((direction, Err(e))) => debug!("Tunnel {} ended: {}, closing", direction, e),
        None => debug!("Tunnel copy tasks ended without reporting"),
    }

    upstream.abort();
    downstream.abort();
    let _ = upstream.await;
    let _ = downstream.await;
}

async fn pump<R, W>(
    direction: Direction,
    mut src: R,
    mut dst: W,
    done: mpsc::Sender<(Direction, io::Result<u64>)>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::io::copy(&mut src, &mut dst).await;
    let _ = done.send((direction, result)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Request;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadBuf};
    use tokio::time::{timeout, Duration};

    /// Duplex stream that counts how often it is dropped.
    struct Tracked {
        inner: DuplexStream,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Tracked {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Tracked {
        fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, data)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    fn tracked(inner: DuplexStream) -> (Tracked, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (Tracked { inner, drops: drops.clone() }, drops)
    }

    #[test]
    fn test_encode_request_line_and_headers() {
        let req = Request::builder()
            .method("GET")
            .uri("/socket?room=1")
            .header("host", "localhost:3000")
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();

        let wire = encode_request(&parts, b"");
        assert_eq!(
            &wire[..],
            &b"GET /socket?room=1 HTTP/1.1\r\nhost: localhost:3000\r\nupgrade: websocket\r\nconnection: Upgrade\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_encode_request_with_body_sets_length() {
        let req = Request::builder()
            .method("POST")
            .uri("/events")
            .header("transfer-encoding", "chunked")
            .body(())
            .unwrap();
        let (parts, _) = req.into_parts();

        let wire = encode_request(&parts, b"hello");
        let text = String::from_utf8(wire.to_vec()).unwrap();
        assert!(text.starts_with("POST /events HTTP/1.1\r\n"));
        assert!(!text.contains("transfer-encoding"));
        assert!(text.ends_with("content-length: 5\r\n\r\nhello"));
    }

    #[tokio::test]
    async fn test_forward_request_writes_verbatim() {
        let (mut near, mut far) = duplex(1024);
        forward_request(&mut near, b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(near);

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_forward_request_failure_is_forward_error() {
        let (mut near, far) = duplex(16);
        drop(far);
        let err = forward_request(&mut near, b"GET / HTTP/1.1\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, ProxyError::Forward(_)));
    }

    #[tokio::test]
    async fn test_round_trip_through_echo_backend() {
        let (client_side, mut client) = duplex(1024);
        let (backend_side, mut backend) = duplex(1024);

        // Echo backend
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match backend.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if backend.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let tunnel = tokio::spawn(splice(client_side, backend_side));

        for chunk in [&b"first"[..], &b"second frame"[..], &b"3"[..]] {
            client.write_all(chunk).await.unwrap();
            let mut echoed = vec![0u8; chunk.len()];
            client.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, chunk);
        }

        drop(client);
        timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_close_closes_backend() {
        let (client_side, client) = duplex(1024);
        let (backend_side, mut backend) = duplex(1024);
        let (client_side, client_drops) = tracked(client_side);
        let (backend_side, backend_drops) = tracked(backend_side);

        let tunnel = tokio::spawn(splice(client_side, backend_side));
        drop(client);

        timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(client_drops.load(Ordering::SeqCst), 1);
        assert_eq!(backend_drops.load(Ordering::SeqCst), 1);

        let mut buf = [0u8; 8];
        assert_eq!(backend.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backend_close_delivers_tail_then_closes_client() {
        let (client_side, mut client) = duplex(1024);
        let (backend_side, mut backend) = duplex(1024);
        let (client_side, client_drops) = tracked(client_side);
        let (backend_side, backend_drops) = tracked(backend_side);

        let tunnel = tokio::spawn(splice(client_side, backend_side));

        backend.write_all(b"data: bye\n\n").await.unwrap();
        drop(backend);

        let mut got = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"data: bye\n\n");

        timeout(Duration::from_secs(5), tunnel).await.unwrap().unwrap();
        assert_eq!(client_drops.load(Ordering::SeqCst), 1);
        assert_eq!(backend_drops.load(Ordering::SeqCst), 1);
    }
}
