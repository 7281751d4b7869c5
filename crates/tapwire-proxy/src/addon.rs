use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{error, info};

use crate::connection::ConnectionContext;
use crate::flow::{BodyReader, Flow, Request, Response, WebSocketMessage};

/// An observer/mutator registered with the proxy. Every hook has a no-op
/// default; implement only what you need.
///
/// Hooks on the same flow are invoked in registration order and are never
/// interleaved. A panicking addon is logged and skipped; it cannot take
/// down the proxy or the flow's transport.
#[allow(unused_variables)]
pub trait Addon: Send + Sync {
    /// After accept, before any I/O on the new client connection.
    fn client_connected(&self, cc: &ConnectionContext) {}
    /// After the client TCP connection has closed.
    fn client_disconnected(&self, cc: &ConnectionContext) {}
    /// After the upstream TCP dial succeeded, before any TLS.
    fn server_connected(&self, cc: &ConnectionContext) {}
    /// After the upstream socket has closed.
    fn server_disconnected(&self, cc: &ConnectionContext) {}
    /// After the upstream TLS handshake completed.
    fn tls_established_server(&self, cc: &ConnectionContext) {}

    /// After the client request line and headers were parsed. Setting
    /// `flow.response` ends the flow without contacting upstream.
    fn request_headers(&self, flow: &mut Flow) {}
    /// After the full request body was buffered. Skipped for streamed flows.
    fn request(&self, flow: &mut Flow) {}
    /// After upstream status and headers were received. Setting a concrete
    /// body ends the flow with that body.
    fn response_headers(&self, flow: &mut Flow) {}
    /// After the full response body was buffered. Skipped for streamed flows.
    fn response(&self, flow: &mut Flow) {}

    /// Wraps the request body reader of a streamed flow.
    fn stream_request_modifier(&self, flow: &Flow, reader: BodyReader) -> BodyReader {
        reader
    }
    /// Wraps the response body reader of a streamed flow.
    fn stream_response_modifier(&self, flow: &Flow, reader: BodyReader) -> BodyReader {
        reader
    }

    /// Once per WebSocket upgrade, before the message shuttle starts.
    fn websocket_handshake(&self, flow: &Flow) {}
    /// For every WebSocket message in either direction, before forwarding.
    fn websocket_message(&self, flow: &Flow, message: &mut WebSocketMessage) {}

    /// Reserved hook for requests addressed to the proxy's own control
    /// endpoints; the first addon returning a response wins.
    fn access_proxy_server(&self, request: &Request) -> Option<Response> {
        None
    }
}

/// The registered addons in invocation order. Frozen at proxy start.
#[derive(Default)]
pub struct AddonChain {
    addons: Vec<Box<dyn Addon>>,
}

macro_rules! connection_hook {
    ($name:ident) => {
        pub(crate) fn $name(&self, cc: &ConnectionContext) {
            for (index, addon) in self.addons.iter().enumerate() {
                guard(index, stringify!($name), || addon.$name(cc));
            }
        }
    };
}

macro_rules! flow_hook {
    ($name:ident) => {
        pub(crate) fn $name(&self, flow: &mut Flow) {
            for (index, addon) in self.addons.iter().enumerate() {
                guard(index, stringify!($name), || addon.$name(flow));
            }
        }
    };
}

impl AddonChain {
    pub(crate) fn new(addons: Vec<Box<dyn Addon>>) -> Self {
        Self { addons }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    connection_hook!(client_connected);
    connection_hook!(client_disconnected);
    connection_hook!(server_connected);
    connection_hook!(server_disconnected);
    connection_hook!(tls_established_server);

    flow_hook!(request_headers);
    flow_hook!(request);
    flow_hook!(response_headers);
    flow_hook!(response);

    pub(crate) fn websocket_handshake(&self, flow: &Flow) {
        for (index, addon) in self.addons.iter().enumerate() {
            guard(index, "websocket_handshake", || {
                addon.websocket_handshake(flow)
            });
        }
    }

    pub(crate) fn websocket_message(&self, flow: &Flow, message: &mut WebSocketMessage) {
        for (index, addon) in self.addons.iter().enumerate() {
            guard(index, "websocket_message", || {
                addon.websocket_message(flow, message)
            });
        }
    }

    pub(crate) fn access_proxy_server(&self, request: &Request) -> Option<Response> {
        for (index, addon) in self.addons.iter().enumerate() {
            if let Some(response) = guard(index, "access_proxy_server", || {
                addon.access_proxy_server(request)
            })
            .flatten()
            {
                return Some(response);
            }
        }
        None
    }

    /// Left-to-right reader composition: the output of addon k is the input
    /// of addon k+1. A panicking modifier has already consumed the reader,
    /// so the chain degrades to an empty body for that flow; the transport
    /// itself survives.
    pub(crate) fn wrap_request_reader(&self, flow: &Flow, mut reader: BodyReader) -> BodyReader {
        for (index, addon) in self.addons.iter().enumerate() {
            reader = match catch_unwind(AssertUnwindSafe(|| {
                addon.stream_request_modifier(flow, reader)
            })) {
                Ok(wrapped) => wrapped,
                Err(_) => {
                    error!(addon = index, hook = "stream_request_modifier", "addon panicked");
                    Box::new(tokio::io::empty())
                }
            };
        }
        reader
    }

    pub(crate) fn wrap_response_reader(&self, flow: &Flow, mut reader: BodyReader) -> BodyReader {
        for (index, addon) in self.addons.iter().enumerate() {
            reader = match catch_unwind(AssertUnwindSafe(|| {
                addon.stream_response_modifier(flow, reader)
            })) {
                Ok(wrapped) => wrapped,
                Err(_) => {
                    error!(addon = index, hook = "stream_response_modifier", "addon panicked");
                    Box::new(tokio::io::empty())
                }
            };
        }
        reader
    }
}

/// Recover barrier around one hook invocation.
fn guard<T>(index: usize, hook: &'static str, call: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let detail = panic_message(&payload);
            error!(addon = index, hook, detail, "addon panicked");
            None
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Logs one line per completed exchange, the default observer installed by
/// the binary.
#[derive(Debug, Default)]
pub struct LogAddon;

impl Addon for LogAddon {
    fn response(&self, flow: &mut Flow) {
        let status = flow
            .response
            .as_ref()
            .map(|response| response.status)
            .unwrap_or_default();
        info!(
            method = %flow.request.method,
            url = %flow.request.url,
            status,
            "flow"
        );
    }

    fn response_headers(&self, flow: &mut Flow) {
        if flow.stream {
            let status = flow
                .response
                .as_ref()
                .map(|response| response.status)
                .unwrap_or_default();
            info!(
                method = %flow.request.method,
                url = %flow.request.url,
                status,
                streamed = true,
                "flow"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{Addon, AddonChain};
    use crate::connection::ConnectionContext;
    use crate::flow::{Flow, Request, Url};

    fn test_flow() -> Flow {
        let cc = Arc::new(ConnectionContext::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 50000),
            true,
        ));
        Flow::new(
            cc,
            Request {
                method: "GET".to_string(),
                url: Url::parse_absolute("http://example.test/").expect("url"),
                proto: "HTTP/1.1".to_string(),
                headers: http::HeaderMap::new(),
                body: None,
            },
        )
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Addon for Recorder {
        fn request_headers(&self, _flow: &mut Flow) {
            self.log.lock().expect("log lock").push(self.name);
        }
    }

    struct Panicker;

    impl Addon for Panicker {
        fn request_headers(&self, _flow: &mut Flow) {
            panic!("misbehaving addon");
        }
    }

    struct Counter(Arc<AtomicUsize>);

    impl Addon for Counter {
        fn request_headers(&self, _flow: &mut Flow) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = AddonChain::new(vec![
            Box::new(Recorder {
                name: "first",
                log: Arc::clone(&log),
            }),
            Box::new(Recorder {
                name: "second",
                log: Arc::clone(&log),
            }),
        ]);

        let mut flow = test_flow();
        chain.request_headers(&mut flow);
        assert_eq!(*log.lock().expect("log lock"), vec!["first", "second"]);
    }

    #[test]
    fn panicking_addon_does_not_stop_the_chain() {
        let count = Arc::new(AtomicUsize::new(0));
        let chain = AddonChain::new(vec![
            Box::new(Panicker),
            Box::new(Counter(Arc::clone(&count))),
        ]);

        let mut flow = test_flow();
        chain.request_headers(&mut flow);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct Upcaser;

    impl Addon for Upcaser {
        fn stream_request_modifier(
            &self,
            _flow: &Flow,
            reader: crate::flow::BodyReader,
        ) -> crate::flow::BodyReader {
            struct Upper(crate::flow::BodyReader);
            impl tokio::io::AsyncRead for Upper {
                fn poll_read(
                    mut self: std::pin::Pin<&mut Self>,
                    cx: &mut std::task::Context<'_>,
                    buf: &mut tokio::io::ReadBuf<'_>,
                ) -> std::task::Poll<std::io::Result<()>> {
                    let before = buf.filled().len();
                    let poll = std::pin::Pin::new(&mut self.0).poll_read(cx, buf);
                    if let std::task::Poll::Ready(Ok(())) = &poll {
                        buf.filled_mut()[before..].make_ascii_uppercase();
                    }
                    poll
                }
            }
            Box::new(Upper(reader))
        }
    }

    #[tokio::test]
    async fn stream_modifiers_compose_left_to_right() {
        use tokio::io::AsyncReadExt;

        let chain = AddonChain::new(vec![Box::new(Upcaser)]);
        let flow = test_flow();
        let reader: crate::flow::BodyReader = Box::new(std::io::Cursor::new(b"hello".to_vec()));
        let mut wrapped = chain.wrap_request_reader(&flow, reader);

        let mut out = Vec::new();
        wrapped.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"HELLO");
    }
}
