//! Interactive MITM proxy for HTTP, HTTPS, and WebSocket traffic.
//!
//! [`Proxy`] accepts explicit proxy clients, decides per CONNECT whether to
//! intercept or tunnel, mints leaf certificates against a local root, and
//! exposes every flow to a chain of [`Addon`]s that can observe, mutate, or
//! short-circuit it. Outbound TLS can emulate a named client fingerprint.

mod addon;
mod attacker;
mod buffered;
mod connection;
mod connector;
mod entry;
mod errors;
mod flow;
mod options;
mod proxy;
mod runtime;
mod tls;
mod websocket;

pub use addon::{Addon, LogAddon};
pub use connection::{ClientConn, ConnectionContext, DialFn, ServerConn};
pub use errors::ProxyError;
pub use flow::{
    BodyReader, Flow, FlowDone, MessageKind, Request, Response, Url, WebSocketMessage,
};
pub use options::Options;
pub use proxy::{BoundProxy, Proxy, ProxyHandle};
pub use runtime::InterceptFn;

pub use tapwire_cert::CertAuthority;
pub use tapwire_fingerprint as fingerprint;
