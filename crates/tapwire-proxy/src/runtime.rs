use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tapwire_cert::CertAuthority;
use tapwire_fingerprint::{ClientHello, ClientHelloSpec, Emulation, Fingerprint};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::addon::AddonChain;
use crate::buffered::{BufferedConn, IoStream};
use crate::connection::ConnectionContext;
use crate::connector::Connector;
use crate::options::{match_host, Options, ProxyAuth};
use crate::tls;

const POOL_IDLE_MAX: std::time::Duration = std::time::Duration::from_secs(60);

/// User-supplied intercept predicate over the CONNECT authority.
pub type InterceptFn = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) enum InterceptDecider {
    /// Intercept everything (default).
    All,
    /// Convenience lists: the deny list is applied first, then the allow
    /// list restricts interception to matching hosts.
    Lists {
        ignore: Vec<String>,
        allow: Vec<String>,
    },
    Predicate(InterceptFn),
}

impl InterceptDecider {
    pub(crate) fn should_intercept(&self, authority: &str) -> bool {
        match self {
            Self::All => true,
            Self::Lists { ignore, allow } => {
                if match_host(authority, ignore) {
                    return false;
                }
                if !allow.is_empty() {
                    return match_host(authority, allow);
                }
                true
            }
            Self::Predicate(predicate) => predicate(authority),
        }
    }
}

/// Idle upstream connections for `use_separate_client` flows, keyed by
/// `scheme://host:port`.
#[derive(Default)]
pub(crate) struct ClientPool {
    idle: DashMap<String, Vec<(BufferedConn<IoStream>, Instant)>>,
}

impl ClientPool {
    pub(crate) fn checkout(&self, key: &str) -> Option<BufferedConn<IoStream>> {
        let mut entry = self.idle.get_mut(key)?;
        while let Some((conn, since)) = entry.pop() {
            if since.elapsed() < POOL_IDLE_MAX {
                return Some(conn);
            }
        }
        None
    }

    pub(crate) fn checkin(&self, key: String, conn: BufferedConn<IoStream>) {
        self.idle.entry(key).or_default().push((conn, Instant::now()));
    }
}

/// Everything the per-connection tasks share.
pub(crate) struct ProxyRuntime {
    pub options: Options,
    pub addons: AddonChain,
    pub authority: Arc<CertAuthority>,
    pub connector: Connector,
    pub emulation: Emulation,
    pub auth: ProxyAuth,
    pub intercept: InterceptDecider,
    pub pool: ClientPool,
    fingerprint_saved: AtomicBool,
}

impl ProxyRuntime {
    pub(crate) fn new(
        options: Options,
        addons: AddonChain,
        authority: Arc<CertAuthority>,
        connector: Connector,
        emulation: Emulation,
        auth: ProxyAuth,
        intercept: InterceptDecider,
    ) -> Self {
        Self {
            options,
            addons,
            authority,
            connector,
            emulation,
            auth,
            intercept,
            pool: ClientPool::default(),
            fingerprint_saved: AtomicBool::new(false),
        }
    }

    pub(crate) fn stream_threshold(&self) -> u64 {
        self.options.stream_large_bodies
    }

    /// The outbound ClientHello spec for this connection, honoring mirror
    /// mode when a captured hello is available.
    pub(crate) fn upstream_spec(
        &self,
        cc: &ConnectionContext,
        server_name: &str,
    ) -> Option<ClientHelloSpec> {
        match &self.emulation {
            Emulation::Default => None,
            Emulation::MirrorClient => {
                let hello = cc.client.client_hello()?;
                Some(tapwire_fingerprint::mirror_client_hello(&hello, server_name))
            }
            Emulation::Profile(profile) => Some(profile.to_spec(server_name)),
        }
    }

    /// Persists the first observed ClientHello when `fingerprint_save` is
    /// configured. Only the first capture wins.
    pub(crate) fn maybe_save_fingerprint(&self, hello: &ClientHello) {
        let name = self.options.fingerprint_save.as_str();
        if name.is_empty() {
            return;
        }
        if self.fingerprint_saved.swap(true, Ordering::AcqRel) {
            return;
        }
        let profile = Fingerprint::from_client_hello(name, hello);
        match tapwire_fingerprint::save_profile(name, &profile) {
            Ok(path) => info!(profile = name, path = %path.display(), "saved client fingerprint"),
            Err(error) => warn!(profile = name, %error, "saving client fingerprint failed"),
        }
    }

    /// Dials the per-connection upstream through the context's late-bound
    /// dialer, then runs TLS when the intercepted scheme requires it.
    pub(crate) async fn open_upstream(
        &self,
        cc: &Arc<ConnectionContext>,
        use_tls: bool,
        host: &str,
        port: u16,
    ) -> io::Result<BufferedConn<IoStream>> {
        let stream = cc.dial_upstream().await?;
        cc.server.record_dial(format!("{host}:{port}"));
        self.addons.server_connected(cc);

        if !use_tls {
            return Ok(BufferedConn::new(Box::new(stream) as IoStream));
        }

        let spec = self.upstream_spec(cc, host);
        let config = tls::upstream_client_config(spec.as_ref(), self.options.ssl_insecure)
            .map_err(io::Error::other)?;
        let tls_stream = tls::upstream_handshake(config, host, stream).await?;
        cc.server.mark_tls_established();
        self.addons.tls_established_server(cc);
        debug!(host, port, "upstream TLS established");
        Ok(BufferedConn::new(Box::new(tls_stream) as IoStream))
    }

    /// Dials an upstream for a `use_separate_client` flow: same connector
    /// and DNS cache, pool-backed, independent of the connection's socket.
    pub(crate) async fn open_shared_upstream(
        &self,
        cc: &Arc<ConnectionContext>,
        use_tls: bool,
        host: &str,
        port: u16,
    ) -> io::Result<(String, BufferedConn<IoStream>)> {
        let scheme = if use_tls { "https" } else { "http" };
        let key = format!("{scheme}://{host}:{port}");
        if let Some(conn) = self.pool.checkout(&key) {
            debug!(key, "reusing pooled upstream connection");
            return Ok((key, conn));
        }

        let stream = self.connector.connect(host, port).await?;
        if !use_tls {
            return Ok((key, BufferedConn::new(Box::new(stream) as IoStream)));
        }

        let spec = self.upstream_spec(cc, host);
        let config = tls::upstream_client_config(spec.as_ref(), self.options.ssl_insecure)
            .map_err(io::Error::other)?;
        let tls_stream = tls::upstream_handshake(config, host, stream).await?;
        Ok((key, BufferedConn::new(Box::new(tls_stream) as IoStream)))
    }
}
