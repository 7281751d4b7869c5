use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use tapwire_fingerprint::ClientHello;
use tokio::net::TcpStream;
use uuid::Uuid;

/// Late-bound upstream dialer. Entry sets one per CONNECT target after
/// classification; the attacker invokes it lazily on first use.
pub type DialFn =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>> + Send + Sync>;

/// Client side of one accepted TCP connection.
#[derive(Debug)]
pub struct ClientConn {
    pub peer_addr: SocketAddr,
    tls_established: AtomicBool,
    negotiated_alpn: Mutex<Option<Vec<u8>>>,
    client_hello: Mutex<Option<ClientHello>>,
    /// When false the core must not contact upstream for its certificate
    /// before the client handshake (lazy attack).
    upstream_cert: AtomicBool,
}

impl ClientConn {
    fn new(peer_addr: SocketAddr, upstream_cert: bool) -> Self {
        Self {
            peer_addr,
            tls_established: AtomicBool::new(false),
            negotiated_alpn: Mutex::new(None),
            client_hello: Mutex::new(None),
            upstream_cert: AtomicBool::new(upstream_cert),
        }
    }

    pub fn upstream_cert(&self) -> bool {
        self.upstream_cert.load(Ordering::Acquire)
    }

    /// Addons may clear this in `client_connected` to force the lazy attack
    /// for this connection.
    pub fn set_upstream_cert(&self, value: bool) {
        self.upstream_cert.store(value, Ordering::Release);
    }

    pub fn tls_established(&self) -> bool {
        self.tls_established.load(Ordering::Acquire)
    }

    pub(crate) fn mark_tls_established(&self, alpn: Option<Vec<u8>>) {
        self.tls_established.store(true, Ordering::Release);
        *self.negotiated_alpn.lock().expect("alpn lock poisoned") = alpn;
    }

    pub fn negotiated_alpn(&self) -> Option<Vec<u8>> {
        self.negotiated_alpn
            .lock()
            .expect("alpn lock poisoned")
            .clone()
    }

    pub(crate) fn record_client_hello(&self, hello: ClientHello) {
        *self
            .client_hello
            .lock()
            .expect("client hello lock poisoned") = Some(hello);
    }

    /// The ClientHello the client presented, when it was captured.
    pub fn client_hello(&self) -> Option<ClientHello> {
        self.client_hello
            .lock()
            .expect("client hello lock poisoned")
            .clone()
    }
}

/// Upstream side of a connection. The socket itself lives with the task
/// serving the connection; the context records address and TLS state so
/// addons can observe them.
#[derive(Debug, Default)]
pub struct ServerConn {
    address: Mutex<Option<String>>,
    tls_established: AtomicBool,
}

impl ServerConn {
    pub fn address(&self) -> Option<String> {
        self.address.lock().expect("address lock poisoned").clone()
    }

    /// First dial wins; later dials on the same connection keep the
    /// original address record.
    pub(crate) fn record_dial(&self, address: String) {
        let mut slot = self.address.lock().expect("address lock poisoned");
        if slot.is_none() {
            *slot = Some(address);
        }
    }

    pub fn tls_established(&self) -> bool {
        self.tls_established.load(Ordering::Acquire)
    }

    pub(crate) fn mark_tls_established(&self) {
        self.tls_established.store(true, Ordering::Release);
    }
}

/// One accepted client connection: owns the client-side state, co-owns the
/// lazily populated upstream state, counts flows.
pub struct ConnectionContext {
    pub id: Uuid,
    pub client: ClientConn,
    pub server: ServerConn,
    flow_count: AtomicU32,
    dial: Mutex<Option<DialFn>>,
}

impl ConnectionContext {
    pub(crate) fn new(peer_addr: SocketAddr, upstream_cert: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            client: ClientConn::new(peer_addr, upstream_cert),
            server: ServerConn::default(),
            flow_count: AtomicU32::new(0),
            dial: Mutex::new(None),
        }
    }

    /// Strictly increasing per-connection flow sequence.
    pub fn next_flow_seq(&self) -> u32 {
        self.flow_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn flow_count(&self) -> u32 {
        self.flow_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_dial(&self, dial: DialFn) {
        *self.dial.lock().expect("dial lock poisoned") = Some(dial);
    }

    /// Invokes the late-bound dialer set by entry classification.
    pub(crate) async fn dial_upstream(&self) -> io::Result<TcpStream> {
        let future = {
            let guard = self.dial.lock().expect("dial lock poisoned");
            let dial = guard.as_ref().ok_or_else(|| {
                io::Error::other("no upstream dialer bound to this connection")
            })?;
            dial()
        };
        future.await
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("peer", &self.client.peer_addr)
            .field("flow_count", &self.flow_count())
            .finish()
    }
}
