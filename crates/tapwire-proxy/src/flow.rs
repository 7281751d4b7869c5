use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::connection::ConnectionContext;

/// A streaming body source. Stream modifiers wrap one of these around the
/// previous reader in registration order.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Minimal URL shape the proxy works with: scheme, authority, path, query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub raw_query: String,
}

impl Url {
    /// Parses an absolute `http://` / `https://` request target.
    pub fn parse_absolute(target: &str) -> Option<Self> {
        let (scheme, rest) = target.split_once("://")?;
        if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
            return None;
        }
        let scheme = scheme.to_ascii_lowercase();
        let default_port = if scheme == "https" { 443 } else { 80 };

        let (authority, path_and_query) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        let (host, port) = split_host_port(authority, default_port)?;

        let (path, raw_query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_and_query.to_string(), String::new()),
        };

        Some(Self {
            scheme,
            host,
            port,
            path,
            raw_query,
        })
    }

    /// Builds a URL for an origin-form target plus the CONNECT authority.
    pub fn from_origin_form(scheme: &str, host: &str, port: u16, target: &str) -> Self {
        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (target.to_string(), String::new()),
        };
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
            path,
            raw_query,
        }
    }

    /// `path?query` origin-form target.
    pub fn request_target(&self) -> String {
        if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        }
    }

    /// `host` or `host:port` with default ports elided.
    pub fn authority(&self) -> String {
        let default_port = if self.scheme == "https" { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for Url {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme,
            self.authority(),
            self.request_target()
        )
    }
}

pub(crate) fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Some((host.to_string(), port.parse().ok()?)),
        _ => Some((authority.to_string(), default_port)),
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    /// Uppercase method token.
    pub method: String,
    pub url: Url,
    /// Protocol label, e.g. `HTTP/1.1`.
    pub proto: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Streaming source; set by `response_headers` addons to replace the
    /// upstream body without buffering it.
    pub body_reader: Option<BodyReader>,
    /// Add `Connection: close` and drop the client connection after writing.
    pub close: bool,
    decoded: bool,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
            body_reader: None,
            close: false,
            decoded: false,
        }
    }

    pub fn with_body(status: u16, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(status);
        response.body = Some(body.into());
        response
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.headers
            .get("content-encoding")
            .and_then(|value| value.to_str().ok())
    }

    /// Decodes the body in place once, removing the transfer headers and
    /// fixing `Content-Length`. Unknown encodings leave the body untouched
    /// and log a warning; repeated calls are no-ops.
    pub fn replace_to_decoded_body(&mut self) {
        if self.decoded {
            return;
        }
        let Some(body) = self.body.as_ref() else {
            return;
        };

        match tapwire_http::decode_body(self.content_encoding(), body) {
            Ok(decoded) => {
                self.headers.remove("content-encoding");
                self.headers.remove("transfer-encoding");
                let length = HeaderValue::from_str(&decoded.len().to_string())
                    .expect("decimal length is a valid header value");
                self.headers.insert("content-length", length);
                self.body = Some(Bytes::from(decoded));
                self.decoded = true;
            }
            Err(tapwire_http::BodyCodecError::UnknownEncoding(value)) => {
                warn!(encoding = %value, "unknown content encoding, body left as-is");
            }
            Err(error) => {
                warn!(%error, "body decode failed, body left as-is");
            }
        }
    }

    /// Whether the content type classifies as text.
    pub fn is_text(&self) -> bool {
        self.headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .is_some_and(tapwire_http::is_text_content_type)
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.as_ref().map(Bytes::len))
            .field("streamed", &self.body_reader.is_some())
            .field("close", &self.close)
            .finish()
    }
}

/// One-shot completion latch. `finish` may be called exactly once; a second
/// call is a programming error and panics.
#[derive(Debug, Default)]
pub struct FlowDone {
    finished: AtomicBool,
    notify: Notify,
}

impl FlowDone {
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            panic!("flow finished twice");
        }
        self.notify.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            let notified = self.notify.notified();
            if self.finished.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// One request/response pair flowing through the proxy.
pub struct Flow {
    pub id: Uuid,
    /// The connection this flow belongs to. Borrowed context, not ownership:
    /// the connection outlives its flows.
    pub conn: Arc<ConnectionContext>,
    pub request: Request,
    /// Set by the upstream response or synthesized by an addon; a non-nil
    /// value set before the response stage short-circuits upstream.
    pub response: Option<Response>,
    /// Streaming mode: request/response hooks are skipped, bodies pass
    /// through the stream modifier chain instead of being buffered.
    pub stream: bool,
    /// Route this flow through the attacker's shared client instead of the
    /// per-connection upstream socket.
    pub use_separate_client: bool,
    /// Inter-addon scratch space, never persisted by the core.
    pub metadata: HashMap<String, serde_json::Value>,
    done: Arc<FlowDone>,
}

impl Flow {
    pub fn new(conn: Arc<ConnectionContext>, request: Request) -> Self {
        Self {
            id: Uuid::new_v4(),
            conn,
            request,
            response: None,
            stream: false,
            use_separate_client: false,
            metadata: HashMap::new(),
            done: Arc::new(FlowDone::default()),
        }
    }

    /// Handle for code that must outlive the flow's hook execution.
    pub fn done_handle(&self) -> Arc<FlowDone> {
        Arc::clone(&self.done)
    }

    pub fn finish(&self) {
        self.done.finish();
    }

    /// True when an addon synthesized a response with a concrete body.
    pub(crate) fn has_synthesized_body(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|response| response.body.is_some() || response.body_reader.is_some())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("method", &self.request.method)
            .field("url", &self.request.url.to_string())
            .field("stream", &self.stream)
            .field("finished", &self.done.is_finished())
            .finish()
    }
}

/// WebSocket message opcodes as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl MessageKind {
    pub fn opcode(self) -> u8 {
        match self {
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One logical WebSocket message; addons may mutate kind and payload before
/// it is written toward its destination.
#[derive(Debug, Clone)]
pub struct WebSocketMessage {
    pub kind: MessageKind,
    pub data: Vec<u8>,
    pub from_client: bool,
}
