//! Classifies requests that need a raw tunnel instead of request/response proxying.

use hyper::header::{HeaderMap, ACCEPT, UPGRADE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// WebSocket upgrade or server-sent events
    Streaming,
    Ordinary,
}

/// `Upgrade: websocket` or `Accept: text/event-stream`, compared case-insensitively.
/// Missing or non-UTF-8 headers never match.
pub fn classify(headers: &HeaderMap) -> RequestKind {
    if header_equals(headers, UPGRADE, "websocket") || header_equals(headers, ACCEPT, "text/event-stream") {
        RequestKind::Streaming
    } else {
        RequestKind::Ordinary
    }
}

fn header_equals(headers: &HeaderMap, name: hyper::header::HeaderName, expected: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}
