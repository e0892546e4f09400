//! Raw takeover of an accepted connection.
//!
//! Hyper serves a connection through a [`HijackableIo`], which only borrows the
//! real transport from a shared slot. A request handler holding the matching
//! [`Hijacker`] can take the transport out of that slot and speak raw bytes on
//! it. From then on hyper sees end-of-stream on reads and errors on writes, so
//! it gives up on the connection without putting anything on the wire.

use crate::error::ProxyError;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any duplex byte stream the front can accept on: plain TCP or TLS.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

type Slot = Arc<Mutex<Option<BoxedTransport>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<BoxedTransport>> {
    // Guards are never held across a panic-prone section, recover anyway
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The connection as hyper sees it.
pub struct HijackableIo {
    slot: Slot,
}

impl HijackableIo {
    pub fn new<T: Transport>(transport: T) -> (Self, Hijacker) {
        let slot: Slot = Arc::new(Mutex::new(Some(Box::new(transport))));
        (Self { slot: Arc::clone(&slot) }, Hijacker { slot })
    }
}

fn hijacked() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection hijacked")
}

impl AsyncRead for HijackableIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match lock(&self.slot).as_mut() {
            Some(transport) => Pin::new(transport).poll_read(cx, buf),
            // EOF: nothing more will ever arrive through hyper
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for HijackableIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match lock(&self.slot).as_mut() {
            Some(transport) => Pin::new(transport).poll_write(cx, data),
            None => Poll::Ready(Err(hijacked())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.slot).as_mut() {
            Some(transport) => Pin::new(transport).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match lock(&self.slot).as_mut() {
            Some(transport) => Pin::new(transport).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

/// Takeover handle for one accepted connection. Travels with every request
/// served on that connection as a request extension.
#[derive(Clone)]
pub struct Hijacker {
    slot: Slot,
}

impl Hijacker {
    /// Whether the connection can still be taken over.
    pub fn is_hijackable(&self) -> bool {
        lock(&self.slot).is_some()
    }

    pub fn is_hijacked(&self) -> bool {
        !self.is_hijackable()
    }

    /// Take exclusive ownership of the raw transport. Succeeds at most once.
    pub fn hijack(&self) -> Result<BoxedTransport, ProxyError> {
        lock(&self.slot).take().ok_or(ProxyError::NotHijackable)
    }
}
