use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use tapwire_http::{parse_request_head, RequestHead};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::attacker::{self, write_simple_response, TargetInfo, MAX_HEAD_BYTES};
use crate::buffered::{BufferedConn, IoStream, PrefixedStream};
use crate::connection::ConnectionContext;
use crate::errors::log_transport_error;
use crate::flow::{split_host_port, Request, Url};
use crate::options::ProxyAuth;
use crate::runtime::ProxyRuntime;
use crate::tls;

const PROXY_AUTH_CHALLENGE: (&str, &str) = ("Proxy-Authenticate", "Basic realm=\"proxy\"");

/// One accepted client connection: `accept → auth → classify → dispatch`.
pub(crate) async fn handle_client(
    rt: Arc<ProxyRuntime>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let cc = Arc::new(ConnectionContext::new(peer, rt.options.upstream_cert));
    rt.addons.client_connected(&cc);

    if let Err(error) = serve_connection(&rt, &cc, stream, &mut shutdown).await {
        log_transport_error("connection", &error);
    }

    rt.addons.client_disconnected(&cc);
}

async fn serve_connection(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let mut conn = BufferedConn::new(stream);

    // The proxy-auth gate loops so a client challenged with 407 can retry
    // on the same connection.
    let head = loop {
        let head_raw = tokio::select! {
            result = conn.read_until_pattern(b"\r\n\r\n", MAX_HEAD_BYTES) => result?,
            _ = shutdown.changed() => return Ok(()),
        };
        let Some(raw) = head_raw else {
            return Ok(());
        };

        let head = match parse_request_head(&raw) {
            Ok(head) => head,
            Err(error) => {
                debug!(%error, "request head parse failed");
                write_simple_response(&mut conn.stream, 400, &[], "malformed request").await?;
                return Ok(());
            }
        };

        if authorized(&rt.auth, &head) {
            break head;
        }
        debug!(peer = %cc.client.peer_addr, "proxy auth challenge");
        let drained = attacker::drain_request_body(&mut conn, head.body_mode).await?;
        write_simple_response(
            &mut conn.stream,
            407,
            &[PROXY_AUTH_CHALLENGE],
            "proxy authentication required",
        )
        .await?;
        if !drained {
            return Ok(());
        }
    };

    // Classification: CONNECT, absolute-form plain HTTP, or a stray
    // direct-access request.
    if head.method == "CONNECT" {
        return connect_dispatch(rt, cc, conn, head, shutdown).await;
    }

    if let Some(url) = Url::parse_absolute(&head.target) {
        bind_dialer(rt, cc, url.host.clone(), url.port);
        let target = TargetInfo {
            use_tls: false,
            host: url.host,
            port: url.port,
        };
        let client = BufferedConn::with_prefix(Box::new(conn.stream) as IoStream, conn.read_buf);
        return attacker::serve(
            Arc::clone(rt),
            Arc::clone(cc),
            client,
            None,
            target,
            Some(head),
            shutdown.clone(),
        )
        .await;
    }

    // Not a proxy request. Reserved control endpoints get a chance first.
    let request = Request {
        method: head.method.clone(),
        url: Url::from_origin_form("http", "", 0, &head.target),
        proto: head.version.as_str().to_string(),
        headers: head.headers.clone(),
        body: None,
    };
    if let Some(response) = rt.addons.access_proxy_server(&request) {
        let body = response.body.unwrap_or_default();
        let text = String::from_utf8_lossy(&body).to_string();
        write_simple_response(&mut conn.stream, response.status, &[], &text).await?;
        return Ok(());
    }
    write_simple_response(&mut conn.stream, 400, &[], "not a proxy request").await?;
    Ok(())
}

/// The CONNECT three-state machine: direct transfer without interception,
/// first attack when the upstream certificate is wanted up front, lazy
/// attack otherwise.
async fn connect_dispatch(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    mut conn: BufferedConn<TcpStream>,
    head: RequestHead,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let Some((host, port)) = split_host_port(&head.target, 443) else {
        write_simple_response(&mut conn.stream, 400, &[], "invalid CONNECT target").await?;
        return Ok(());
    };

    bind_dialer(rt, cc, host.clone(), port);

    if !rt.intercept.should_intercept(&head.target) {
        return direct_transfer(rt, cc, conn, &host, port, true).await;
    }
    if cc.client.upstream_cert() {
        first_attack(rt, cc, conn, host, port, shutdown).await
    } else {
        lazy_attack(rt, cc, conn, host, port, shutdown).await
    }
}

/// Binds the late-bound upstream dialer for this connection's target.
fn bind_dialer(rt: &Arc<ProxyRuntime>, cc: &Arc<ConnectionContext>, host: String, port: u16) {
    let rt = Arc::clone(rt);
    cc.set_dial(Box::new(move || {
        let rt = Arc::clone(&rt);
        let host = host.clone();
        Box::pin(async move { rt.connector.connect(&host, port).await })
    }));
}

/// Opaque byte shuttling without interception. No addon that reads flow
/// content runs on this path. `announce` controls whether the CONNECT
/// response still has to be written; the lazy-attack fallback arrives here
/// with the 200 already on the wire.
async fn direct_transfer(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    mut conn: BufferedConn<TcpStream>,
    host: &str,
    port: u16,
    announce: bool,
) -> io::Result<()> {
    let mut upstream = match cc.dial_upstream().await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(host, port, %error, "direct transfer dial failed");
            if announce {
                write_simple_response(&mut conn.stream, 502, &[], "upstream connect failed")
                    .await?;
            }
            return Ok(());
        }
    };
    cc.server.record_dial(format!("{host}:{port}"));
    rt.addons.server_connected(cc);

    if announce {
        conn.stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
    }

    if !conn.read_buf.is_empty() {
        upstream.write_all(&conn.read_buf).await?;
        conn.read_buf.clear();
    }

    let result = tokio::io::copy_bidirectional(&mut conn.stream, &mut upstream).await;
    rt.addons.server_disconnected(cc);
    match result {
        Ok((from_client, from_server)) => {
            debug!(host, port, from_client, from_server, "direct transfer complete");
            Ok(())
        }
        Err(error) => {
            log_transport_error("direct_transfer", &error);
            Ok(())
        }
    }
}

/// First attack: the upstream TLS handshake runs before the client is
/// answered so the minted leaf can copy the real certificate's names.
async fn first_attack(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    mut conn: BufferedConn<TcpStream>,
    host: String,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let upstream_tcp = match cc.dial_upstream().await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(host, port, %error, "first attack dial failed");
            write_simple_response(&mut conn.stream, 502, &[], "upstream connect failed").await?;
            return Ok(());
        }
    };
    cc.server.record_dial(format!("{host}:{port}"));
    rt.addons.server_connected(cc);

    // Mirror mode has no captured hello yet on this path; the emulation
    // ladder falls back to the default hello for the probe handshake.
    let spec = rt.upstream_spec(cc, &host);
    let config = tls::upstream_client_config(spec.as_ref(), rt.options.ssl_insecure)
        .map_err(io::Error::other)?;
    let upstream_tls = match tls::upstream_handshake(config, &host, upstream_tcp).await {
        Ok(stream) => stream,
        Err(error) => {
            log_transport_error("upstream_tls", &error);
            rt.addons.server_disconnected(cc);
            write_simple_response(&mut conn.stream, 502, &[], "upstream TLS failed").await?;
            return Ok(());
        }
    };
    cc.server.mark_tls_established();
    rt.addons.tls_established_server(cc);

    let upstream_alt_names = upstream_tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(tls::certificate_alt_names)
        .unwrap_or_default();

    conn.stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let hello = match tls::capture_client_hello(&mut conn).await {
        Ok(Some(hello)) => hello,
        Ok(None) => {
            // Plaintext after CONNECT is a protocol error on this path.
            debug!(host, "expected TLS from client, got plaintext");
            return Ok(());
        }
        Err(error) => {
            log_transport_error("client_hello", &error);
            return Ok(());
        }
    };
    cc.client.record_client_hello(hello.clone());
    rt.maybe_save_fingerprint(&hello);

    let sni = hello
        .server_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| host.clone());
    let client_tls = match accept_client_tls(rt, cc, conn, &sni, &upstream_alt_names).await? {
        Some(stream) => stream,
        None => return Ok(()),
    };

    attacker::serve(
        Arc::clone(rt),
        Arc::clone(cc),
        BufferedConn::new(client_tls),
        Some(BufferedConn::new(Box::new(upstream_tls) as IoStream)),
        TargetInfo {
            use_tls: true,
            host,
            port,
        },
        None,
        shutdown.clone(),
    )
    .await
}

/// Lazy attack: answer the client first, peek at its next bytes, and only
/// intercept when they are TLS. Plaintext falls back to direct transfer.
async fn lazy_attack(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    mut conn: BufferedConn<TcpStream>,
    host: String,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    conn.stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let hello = match tls::capture_client_hello(&mut conn).await {
        Ok(Some(hello)) => hello,
        Ok(None) => {
            debug!(host, "lazy attack fell back to direct transfer");
            return direct_transfer(rt, cc, conn, &host, port, false).await;
        }
        Err(error) => {
            log_transport_error("client_hello", &error);
            return Ok(());
        }
    };
    cc.client.record_client_hello(hello.clone());
    rt.maybe_save_fingerprint(&hello);

    // The leaf is minted from the SNI alone; upstream is contacted only at
    // replay time.
    let sni = hello
        .server_name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| host.clone());
    let client_tls = match accept_client_tls(rt, cc, conn, &sni, &[]).await? {
        Some(stream) => stream,
        None => return Ok(()),
    };

    attacker::serve(
        Arc::clone(rt),
        Arc::clone(cc),
        BufferedConn::new(client_tls),
        None,
        TargetInfo {
            use_tls: true,
            host,
            port,
        },
        None,
        shutdown.clone(),
    )
    .await
}

/// Mints the leaf and completes the client-facing handshake, replaying the
/// already-peeked ClientHello bytes into the acceptor.
async fn accept_client_tls(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    conn: BufferedConn<TcpStream>,
    sni: &str,
    alt_names: &[String],
) -> io::Result<Option<IoStream>> {
    let issued = match rt.authority.get_cert_for(sni, alt_names).await {
        Ok(issued) => issued,
        Err(error) => {
            // Signing details stay out of anything client-visible.
            tracing::error!(host = sni, %error, "leaf issuance failed");
            return Ok(None);
        }
    };
    let alpn = tls::client_alpn_offer(cc.client.client_hello().as_ref());
    let config = match issued.server_config(alpn) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(host = sni, %error, "server config build failed");
            return Ok(None);
        }
    };

    let stream = PrefixedStream::new(conn.read_buf, conn.stream);
    match TlsAcceptor::from(config).accept(stream).await {
        Ok(tls_stream) => {
            let negotiated = tls_stream
                .get_ref()
                .1
                .alpn_protocol()
                .map(ToOwned::to_owned);
            cc.client.mark_tls_established(negotiated);
            Ok(Some(Box::new(tls_stream) as IoStream))
        }
        Err(error) => {
            log_transport_error("client_tls", &error);
            Ok(None)
        }
    }
}

fn authorized(auth: &ProxyAuth, head: &RequestHead) -> bool {
    if matches!(auth, ProxyAuth::Disabled) {
        return true;
    }
    let Some(value) = head
        .headers
        .get("proxy-authorization")
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic ")) else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = text.split_once(':') else {
        return false;
    };
    auth.accepts(user, pass)
}
