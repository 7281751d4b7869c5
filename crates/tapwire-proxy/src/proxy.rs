use std::sync::Arc;
use std::time::Duration;

use tapwire_cert::CertAuthority;
use tapwire_fingerprint::resolve_emulation;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::addon::{Addon, AddonChain};
use crate::connector::{Connector, ParentProxy};
use crate::entry;
use crate::errors::ProxyError;
use crate::options::{Options, ProxyAuth};
use crate::runtime::{InterceptDecider, InterceptFn, ProxyRuntime};

/// How long live connections get to drain after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The proxy facade: composes the certificate authority, the upstream
/// connector, and the addon chain, then serves connections until shutdown.
///
/// Addons and the intercept rule can only be changed before [`Proxy::start`]
/// consumes the value; afterwards the chain is frozen.
pub struct Proxy {
    options: Options,
    addons: Vec<Box<dyn Addon>>,
    intercept: Option<InterceptFn>,
    authority: Arc<CertAuthority>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Handle for stopping a running proxy from another task.
#[derive(Clone)]
pub struct ProxyHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl ProxyHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Proxy {
    /// Builds a proxy whose root CA is persisted under the configured
    /// certificate directory.
    pub fn new(options: Options) -> Result<Self, ProxyError> {
        let authority = CertAuthority::load_or_create(options.cert_dir())?;
        Self::with_authority(options, authority)
    }

    /// Builds a proxy around an existing authority, e.g. an in-memory root.
    pub fn with_authority(
        options: Options,
        authority: CertAuthority,
    ) -> Result<Self, ProxyError> {
        // Configuration problems abort startup; nothing is lazily deferred.
        options.listen_addr()?;
        ProxyAuth::parse(&options.proxyauth)?;
        if !options.upstream.is_empty() {
            ParentProxy::parse(&options.upstream)?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            options,
            addons: Vec::new(),
            intercept: None,
            authority: Arc::new(authority),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Registers an addon at the end of the chain.
    pub fn add_addon(&mut self, addon: Box<dyn Addon>) {
        self.addons.push(addon);
    }

    /// Installs a predicate over the CONNECT authority deciding whether a
    /// host is intercepted. Overrides the allow/ignore list configuration.
    pub fn set_should_intercept(
        &mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) {
        self.intercept = Some(Box::new(predicate));
    }

    /// The root certificate in PEM form, for client trust stores.
    pub fn root_cert_pem(&self) -> &str {
        self.authority.root_cert_pem()
    }

    pub fn shutdown_handle(&self) -> ProxyHandle {
        ProxyHandle {
            shutdown_tx: self.shutdown_tx.clone(),
        }
    }

    /// Binds the listener and serves until shutdown.
    pub async fn start(self) -> Result<(), ProxyError> {
        self.bind().await?.serve().await
    }

    /// Binds the listener and freezes the configuration; `serve` runs the
    /// accept loop. Splitting the two lets embedders bind port 0 and read
    /// the assigned address back.
    pub async fn bind(self) -> Result<BoundProxy, ProxyError> {
        let addr = self.options.listen_addr()?;
        let auth = ProxyAuth::parse(&self.options.proxyauth)?;
        let parent = if self.options.upstream.is_empty() {
            None
        } else {
            Some(ParentProxy::parse(&self.options.upstream)?)
        };
        let connector = Connector::new(
            &self.options.dns_resolvers,
            self.options.dns_retries,
            parent,
        )?;

        let intercept = match self.intercept {
            Some(predicate) => InterceptDecider::Predicate(predicate),
            None if !self.options.ignore_hosts.is_empty()
                || !self.options.allow_hosts.is_empty() =>
            {
                InterceptDecider::Lists {
                    ignore: self.options.ignore_hosts.clone(),
                    allow: self.options.allow_hosts.clone(),
                }
            }
            None => InterceptDecider::All,
        };

        let emulation = resolve_emulation(&self.options.tls_fingerprint);
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "proxy listening");

        let runtime = Arc::new(ProxyRuntime::new(
            self.options,
            AddonChain::new(self.addons),
            self.authority,
            connector,
            emulation,
            auth,
            intercept,
        ));

        Ok(BoundProxy {
            listener,
            runtime,
            shutdown_rx: self.shutdown_rx,
        })
    }
}

/// A proxy with its listener bound and configuration frozen.
pub struct BoundProxy {
    listener: TcpListener,
    runtime: Arc<ProxyRuntime>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BoundProxy {
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop until shutdown, then drains with a bounded
    /// grace period before force-closing the remaining connections.
    pub async fn serve(self) -> Result<(), ProxyError> {
        let BoundProxy {
            listener,
            runtime,
            mut shutdown_rx,
        } = self;

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "client connected");
                            connections.spawn(entry::handle_client(
                                Arc::clone(&runtime),
                                stream,
                                peer,
                                shutdown_rx.clone(),
                            ));
                        }
                        Err(error) => {
                            warn!(%error, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace period expired, aborting remaining connections");
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        info!("proxy stopped");
        Ok(())
    }
}
