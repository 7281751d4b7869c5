use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use tapwire_http::{
    is_hop_by_hop, parse_chunk_size_line, parse_request_head, parse_response_head,
    serialize_request_head, serialize_response_head, BodyMode, HttpVersion, RequestHead,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tracing::debug;

use crate::buffered::{BufferedConn, IoStream};
use crate::connection::ConnectionContext;
use crate::errors::log_transport_error;
use crate::flow::{BodyReader, Flow, Request, Response, Url};
use crate::runtime::ProxyRuntime;
use crate::websocket;

pub(crate) const MAX_HEAD_BYTES: usize = 64 * 1024;
const CHUNK_LINE_LIMIT: usize = 8 * 1024;
const STREAM_PIPE_CAPACITY: usize = 16 * 1024;
/// Short-circuited flows drain at most this much unread request body before
/// giving up on keepalive.
const DRAIN_CAP: u64 = 1024 * 1024;

/// Where intercepted requests of this connection go by default.
pub(crate) struct TargetInfo {
    pub use_tls: bool,
    pub host: String,
    pub port: u16,
}

impl TargetInfo {
    fn scheme(&self) -> &'static str {
        if self.use_tls {
            "https"
        } else {
            "http"
        }
    }
}

enum Disposition {
    /// Keepalive: serve the next request on this connection.
    Continue,
    /// Stop serving; the connection is closed or was handed off.
    Done,
}

/// Serves successive HTTP requests over a post-interception (or plain
/// proxy) client connection until it closes, each through the full addon
/// pipeline.
pub(crate) async fn serve(
    rt: Arc<ProxyRuntime>,
    cc: Arc<ConnectionContext>,
    mut client: BufferedConn<IoStream>,
    mut upstream: Option<BufferedConn<IoStream>>,
    target: TargetInfo,
    mut initial: Option<RequestHead>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        let head = match initial.take() {
            Some(head) => head,
            None => {
                let head_raw = tokio::select! {
                    result = client.read_until_pattern(b"\r\n\r\n", MAX_HEAD_BYTES) => {
                        match result {
                            Ok(value) => value,
                            Err(error) => {
                                log_transport_error("client_head_read", &error);
                                return Ok(());
                            }
                        }
                    }
                    _ = shutdown.changed() => return Ok(()),
                };
                let Some(raw) = head_raw else {
                    return Ok(());
                };
                match parse_request_head(&raw) {
                    Ok(head) => head,
                    Err(error) => {
                        debug!(%error, "request head parse failed");
                        write_simple_response(&mut client.stream, 400, &[], "malformed request")
                            .await?;
                        return Ok(());
                    }
                }
            }
        };

        match handle_one_flow(&rt, &cc, &mut client, &mut upstream, &target, head).await? {
            Disposition::Continue => continue,
            Disposition::Done => return Ok(()),
        }
    }
}

async fn handle_one_flow(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    client: &mut BufferedConn<IoStream>,
    upstream: &mut Option<BufferedConn<IoStream>>,
    target: &TargetInfo,
    head: RequestHead,
) -> io::Result<Disposition> {
    cc.next_flow_seq();

    let url = request_url(&head, target);
    let request = Request {
        method: head.method.clone(),
        url,
        proto: head.version.as_str().to_string(),
        headers: head.headers.clone(),
        body: None,
    };
    let mut flow = Flow::new(Arc::clone(cc), request);
    let client_wants_close = head.connection_close;

    // Stage 1: request headers.
    rt.addons.request_headers(&mut flow);
    if flow.response.is_some() {
        let clean = drain_request_body(client, head.body_mode).await?;
        let disposition = finish_with_response(client, &mut flow, client_wants_close || !clean).await?;
        flow.finish();
        return Ok(disposition);
    }

    // Stage 2: request body, buffered or streamed past the threshold.
    let request_body = match read_body_with_threshold(client, head.body_mode, rt.stream_threshold())
        .await
    {
        Ok(body) => body,
        Err(error) => {
            log_transport_error("client_body_read", &error);
            flow.finish();
            return Ok(Disposition::Done);
        }
    };

    // The effective decision is `flow.stream || size > threshold`: an addon
    // forcing `stream` in `request_headers` drives the modifier path even
    // for a small body, and the buffered `request` hook never fires.
    let streaming_request = match request_body {
        FlowBody::Streaming(streaming) => {
            flow.stream = true;
            Some(streaming)
        }
        FlowBody::Buffered(bytes) if flow.stream => Some(StreamingBody {
            prefix: bytes,
            resume: BodyResume::Exact(0),
        }),
        FlowBody::Buffered(bytes) => {
            flow.request.body = Some(Bytes::from(bytes));
            rt.addons.request(&mut flow);
            if flow.response.is_some() {
                let disposition = finish_with_response(client, &mut flow, client_wants_close).await?;
                flow.finish();
                return Ok(disposition);
            }
            None
        }
        FlowBody::None if flow.stream => None,
        FlowBody::None => {
            rt.addons.request(&mut flow);
            if flow.response.is_some() {
                let disposition = finish_with_response(client, &mut flow, client_wants_close).await?;
                flow.finish();
                return Ok(disposition);
            }
            None
        }
    };

    // Stage 3/4: upstream selection and dial. Requests addressed away from
    // the connection's default target (plain-proxy keepalive to a second
    // host) go through the shared client as well.
    if !flow.use_separate_client
        && (flow.request.url.host != target.host || flow.request.url.port != target.port)
    {
        flow.use_separate_client = true;
    }
    let mut separate_conn: Option<(String, BufferedConn<IoStream>)> = None;
    if flow.use_separate_client {
        let host = flow.request.url.host.clone();
        let port = flow.request.url.port;
        match rt
            .open_shared_upstream(cc, flow.request.url.scheme == "https", &host, port)
            .await
        {
            Ok(opened) => separate_conn = Some(opened),
            Err(error) => {
                let disposition =
                    respond_dial_failure(client, &mut flow, &error, client_wants_close).await?;
                flow.finish();
                return Ok(disposition);
            }
        }
    } else if upstream.is_none() {
        match rt
            .open_upstream(cc, target.use_tls, &target.host, target.port)
            .await
        {
            Ok(opened) => *upstream = Some(opened),
            Err(error) => {
                let disposition =
                    respond_dial_failure(client, &mut flow, &error, client_wants_close).await?;
                flow.finish();
                return Ok(disposition);
            }
        }
    }

    let upstream_conn = match separate_conn.as_mut() {
        Some((_, conn)) => conn,
        None => upstream.as_mut().expect("upstream established above"),
    };

    // Stage 5: replay upstream.
    let replay =
        replay_request(rt, client, upstream_conn, &mut flow, streaming_request).await;
    if let Err(error) = replay {
        log_transport_error("upstream_replay", &error);
        drop_upstream(rt, cc, upstream, separate_conn);
        let disposition =
            respond_dial_failure(client, &mut flow, &error, client_wants_close).await?;
        flow.finish();
        return Ok(disposition);
    }

    // Stage 6: response head.
    let response_raw = match upstream_conn.read_until_pattern(b"\r\n\r\n", MAX_HEAD_BYTES).await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            drop_upstream(rt, cc, upstream, separate_conn);
            let error = io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "upstream closed before response headers",
            );
            let disposition =
                respond_dial_failure(client, &mut flow, &error, client_wants_close).await?;
            flow.finish();
            return Ok(disposition);
        }
        Err(error) => {
            drop_upstream(rt, cc, upstream, separate_conn);
            let disposition =
                respond_dial_failure(client, &mut flow, &error, client_wants_close).await?;
            flow.finish();
            return Ok(disposition);
        }
    };
    let response_head = match parse_response_head(&response_raw, &flow.request.method) {
        Ok(head) => head,
        Err(error) => {
            debug!(%error, "response head parse failed");
            drop_upstream(rt, cc, upstream, separate_conn);
            write_simple_response(&mut client.stream, 502, &[], "bad upstream response").await?;
            flow.finish();
            return Ok(Disposition::Continue);
        }
    };

    let mut response = Response::new(response_head.status);
    response.headers = response_head.headers.clone();
    response.close = response_head.connection_close;
    flow.response = Some(response);

    rt.addons.response_headers(&mut flow);

    // WebSocket upgrade intercepts the pipeline before any body handling.
    // The head written to the client reflects any `response_headers`
    // mutations, so the upgrade is re-serialized rather than replayed.
    if response_head.status == 101 {
        let upgraded_response = flow
            .response
            .as_ref()
            .map(|response| (response.status, response.headers.clone()));
        let confirmed = upgraded_response
            .as_ref()
            .is_some_and(|(_, headers)| is_websocket_upgrade(&head.headers, headers));
        if confirmed {
            let (status, headers) = upgraded_response.expect("response set above");
            let head_bytes = serialize_response_head(
                HttpVersion::Http11,
                status,
                reason_phrase(status),
                &headers,
            );
            client.stream.write_all(&head_bytes).await?;
            client.stream.flush().await?;
            let upstream_conn = match separate_conn {
                Some((_, conn)) => conn,
                None => upstream.take().expect("upstream present for upgrade"),
            };
            // Ownership of both sockets transfers to the bridge; the serve
            // loop gets an inert placeholder back.
            let (placeholder, _other_end) = tokio::io::duplex(1);
            let client_conn = std::mem::replace(
                client,
                BufferedConn::new(Box::new(placeholder) as IoStream),
            );
            websocket::bridge(Arc::clone(rt), flow, client_conn, upstream_conn).await;
            return Ok(Disposition::Done);
        }
        debug!("101 response without websocket upgrade headers");
        drop_upstream(rt, cc, upstream, separate_conn);
        flow.finish();
        return Ok(Disposition::Done);
    }

    // An addon supplied the body: the upstream's body is never read.
    if flow.has_synthesized_body() {
        drop_upstream(rt, cc, upstream, separate_conn);
        let disposition = finish_with_response(client, &mut flow, client_wants_close).await?;
        flow.finish();
        return Ok(disposition);
    }

    // Stage 7: response body, symmetric to the request side.
    let body_result = read_body_with_threshold(
        upstream_conn,
        response_head.body_mode,
        rt.stream_threshold(),
    )
    .await;
    let response_body = match body_result {
        Ok(body) => body,
        Err(error) => {
            log_transport_error("upstream_body_read", &error);
            drop_upstream(rt, cc, upstream, separate_conn);
            flow.finish();
            return Ok(Disposition::Done);
        }
    };

    // Same effective decision as the request side: a flow already in
    // streaming mode keeps the modifier path even when the response body
    // fit under the threshold.
    let response_body = match response_body {
        FlowBody::Buffered(bytes) if flow.stream => FlowBody::Streaming(StreamingBody {
            prefix: bytes,
            resume: BodyResume::Exact(0),
        }),
        other => other,
    };

    let disposition = match response_body {
        FlowBody::Streaming(streaming) => {
            flow.stream = true;
            let result =
                stream_response_to_client(rt, client, upstream_conn, &mut flow, streaming).await;
            match result {
                Ok(()) => {
                    let close = flow
                        .response
                        .as_ref()
                        .map(|response| response.close)
                        .unwrap_or(false);
                    if close || client_wants_close || response_head.body_mode == BodyMode::CloseDelimited {
                        drop_upstream(rt, cc, upstream, separate_conn);
                        let _ = client.stream.shutdown().await;
                        Disposition::Done
                    } else {
                        checkin_separate(rt, separate_conn);
                        Disposition::Continue
                    }
                }
                Err(error) => {
                    // Mid-stream failure closes both sides.
                    log_transport_error("response_stream", &error);
                    drop_upstream(rt, cc, upstream, separate_conn);
                    let _ = client.stream.shutdown().await;
                    Disposition::Done
                }
            }
        }
        FlowBody::Buffered(bytes) => {
            if let Some(response) = flow.response.as_mut() {
                response.body = Some(Bytes::from(bytes));
            }
            rt.addons.response(&mut flow);
            let reused = response_head.body_mode != BodyMode::CloseDelimited;
            let disposition =
                finish_with_response(client, &mut flow, client_wants_close).await?;
            if matches!(disposition, Disposition::Continue) && reused {
                checkin_separate(rt, separate_conn);
            } else {
                drop_upstream(rt, cc, upstream, separate_conn);
            }
            disposition
        }
        FlowBody::None => {
            if !flow.stream {
                rt.addons.response(&mut flow);
            }
            let disposition =
                finish_with_response(client, &mut flow, client_wants_close).await?;
            if matches!(disposition, Disposition::Continue) {
                checkin_separate(rt, separate_conn);
            } else {
                drop_upstream(rt, cc, upstream, separate_conn);
            }
            disposition
        }
    };

    flow.finish();
    Ok(disposition)
}

fn request_url(head: &RequestHead, target: &TargetInfo) -> Url {
    if let Some(absolute) = Url::parse_absolute(&head.target) {
        return absolute;
    }
    let (host, port) = head
        .headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .and_then(|authority| {
            crate::flow::split_host_port(authority, if target.use_tls { 443 } else { 80 })
        })
        .unwrap_or_else(|| (target.host.clone(), target.port));
    Url::from_origin_form(target.scheme(), &host, port, &head.target)
}

/// Body of one message after the buffering decision.
enum FlowBody {
    None,
    Buffered(Vec<u8>),
    Streaming(StreamingBody),
}

/// Where a body flipped to streaming: what was buffered so far plus how the
/// remainder is framed on the wire.
struct StreamingBody {
    prefix: Vec<u8>,
    resume: BodyResume,
}

enum BodyResume {
    Exact(u64),
    Chunked { remaining_in_chunk: u64 },
    UntilEof,
}

/// Reads a body respecting the streaming threshold: a body whose size is
/// known (or grows) strictly beyond the threshold flips to streaming with
/// the buffered bytes as prefix.
async fn read_body_with_threshold<S>(
    conn: &mut BufferedConn<S>,
    mode: BodyMode,
    threshold: u64,
) -> io::Result<FlowBody>
where
    S: AsyncRead + Unpin,
{
    match mode {
        BodyMode::None => Ok(FlowBody::None),
        BodyMode::ContentLength(length) => {
            if length > threshold {
                return Ok(FlowBody::Streaming(StreamingBody {
                    prefix: Vec::new(),
                    resume: BodyResume::Exact(length),
                }));
            }
            let bytes = conn.read_exact_buffered(length as usize).await?;
            Ok(FlowBody::Buffered(bytes))
        }
        BodyMode::Chunked => read_chunked_with_threshold(conn, threshold).await,
        BodyMode::CloseDelimited => {
            let mut buffered = Vec::new();
            let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
            loop {
                let read = conn.read_some(&mut chunk).await?;
                if read == 0 {
                    return Ok(FlowBody::Buffered(buffered));
                }
                buffered.extend_from_slice(&chunk[..read]);
                if buffered.len() as u64 > threshold {
                    return Ok(FlowBody::Streaming(StreamingBody {
                        prefix: buffered,
                        resume: BodyResume::UntilEof,
                    }));
                }
            }
        }
    }
}

async fn read_chunked_with_threshold<S>(
    conn: &mut BufferedConn<S>,
    threshold: u64,
) -> io::Result<FlowBody>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = Vec::new();
    loop {
        let line = read_chunk_line(conn).await?;
        let mut remaining = parse_chunk_size_line(&line)?;
        if remaining == 0 {
            consume_chunked_trailers(conn).await?;
            return Ok(FlowBody::Buffered(buffered));
        }

        let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let read = conn.read_some(&mut chunk[..want]).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-chunk",
                ));
            }
            buffered.extend_from_slice(&chunk[..read]);
            remaining -= read as u64;

            // The running count crossed the threshold: flip to streaming,
            // prepending everything buffered so far.
            if buffered.len() as u64 > threshold {
                return Ok(FlowBody::Streaming(StreamingBody {
                    prefix: std::mem::take(&mut buffered),
                    resume: BodyResume::Chunked {
                        remaining_in_chunk: remaining,
                    },
                }));
            }
        }
        expect_chunk_terminator(conn).await?;
    }
}

async fn read_chunk_line<S>(conn: &mut BufferedConn<S>) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    conn.read_until_pattern(b"\r\n", CHUNK_LINE_LIMIT)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunk size line",
            )
        })
}

async fn expect_chunk_terminator<S>(conn: &mut BufferedConn<S>) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let terminator = conn.read_exact_buffered(2).await?;
    if terminator != b"\r\n" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid chunk terminator",
        ));
    }
    Ok(())
}

async fn consume_chunked_trailers<S>(conn: &mut BufferedConn<S>) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    // After the zero-size chunk: either the bare CRLF or trailer lines
    // terminated by an empty one. Trailers are dropped.
    loop {
        let line = read_chunk_line(conn).await?;
        if line == b"\r\n" {
            return Ok(());
        }
    }
}

/// Pumps the remaining wire body (decoded of chunk framing) into `sink`.
async fn pump_body<S>(
    conn: &mut BufferedConn<S>,
    streaming: StreamingBody,
    mut sink: DuplexStream,
) -> io::Result<u64>
where
    S: AsyncRead + Unpin,
{
    let mut total = streaming.prefix.len() as u64;
    sink.write_all(&streaming.prefix).await?;

    match streaming.resume {
        BodyResume::Exact(mut remaining) => {
            let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
            while remaining > 0 {
                let want = chunk.len().min(remaining as usize);
                let read = conn.read_some(&mut chunk[..want]).await?;
                if read == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before body completed",
                    ));
                }
                sink.write_all(&chunk[..read]).await?;
                remaining -= read as u64;
                total += read as u64;
            }
        }
        BodyResume::Chunked {
            mut remaining_in_chunk,
        } => loop {
            let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
            while remaining_in_chunk > 0 {
                let want = chunk.len().min(remaining_in_chunk as usize);
                let read = conn.read_some(&mut chunk[..want]).await?;
                if read == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-chunk",
                    ));
                }
                sink.write_all(&chunk[..read]).await?;
                remaining_in_chunk -= read as u64;
                total += read as u64;
            }
            expect_chunk_terminator(conn).await?;

            let line = read_chunk_line(conn).await?;
            remaining_in_chunk = parse_chunk_size_line(&line)?;
            if remaining_in_chunk == 0 {
                consume_chunked_trailers(conn).await?;
                break;
            }
        },
        BodyResume::UntilEof => {
            let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
            loop {
                let read = conn.read_some(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                sink.write_all(&chunk[..read]).await?;
                total += read as u64;
            }
        }
    }

    sink.shutdown().await?;
    Ok(total)
}

/// Copies a (possibly modifier-wrapped) reader to the sink as chunked
/// transfer coding, terminating with the last-chunk marker.
async fn copy_reader_as_chunks<W>(reader: &mut BodyReader, sink: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut total = 0_u64;
    let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            sink.write_all(b"0\r\n\r\n").await?;
            sink.flush().await?;
            return Ok(total);
        }
        sink.write_all(format!("{read:x}\r\n").as_bytes()).await?;
        sink.write_all(&chunk[..read]).await?;
        sink.write_all(b"\r\n").await?;
        sink.flush().await?;
        total += read as u64;
    }
}

/// Stage 5: serialize the (possibly mutated) request toward upstream,
/// buffered bytes or the modifier-wrapped stream.
async fn replay_request(
    rt: &Arc<ProxyRuntime>,
    client: &mut BufferedConn<IoStream>,
    upstream: &mut BufferedConn<IoStream>,
    flow: &mut Flow,
    streaming: Option<StreamingBody>,
) -> io::Result<()> {
    let mut headers = outbound_headers(&flow.request.headers);
    let authority = flow.request.url.authority();
    if !headers.contains_key("host") {
        headers.insert(
            "host",
            HeaderValue::from_str(&authority)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host header"))?,
        );
    }
    // Upgrade negotiation survives the hop-by-hop strip: without these two
    // headers upstream would never agree to switch protocols.
    if header_has_token(&flow.request.headers, "upgrade", "websocket") {
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
    }

    match streaming {
        None => {
            let body = flow.request.body.clone().unwrap_or_default();
            if !body.is_empty() || flow.request.method_has_body() {
                headers.insert(
                    "content-length",
                    HeaderValue::from_str(&body.len().to_string())
                        .expect("decimal length header"),
                );
            }
            let head = serialize_request_head(
                &flow.request.method,
                &flow.request.url.request_target(),
                HttpVersion::Http11,
                &headers,
            );
            upstream.stream.write_all(&head).await?;
            if !body.is_empty() {
                upstream.stream.write_all(&body).await?;
            }
            upstream.stream.flush().await?;
            Ok(())
        }
        Some(streaming) => {
            headers.remove("content-length");
            headers.insert(
                "transfer-encoding",
                HeaderValue::from_static("chunked"),
            );
            let head = serialize_request_head(
                &flow.request.method,
                &flow.request.url.request_target(),
                HttpVersion::Http11,
                &headers,
            );
            upstream.stream.write_all(&head).await?;

            let (pump_end, reader_end) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
            let mut wrapped = rt
                .addons
                .wrap_request_reader(flow, Box::new(reader_end) as BodyReader);

            let (pump_result, send_result) = tokio::join!(
                pump_body(client, streaming, pump_end),
                copy_reader_as_chunks(&mut wrapped, &mut upstream.stream),
            );
            pump_result?;
            send_result?;
            Ok(())
        }
    }
}

/// Stage 7 for streamed responses: head first, then the modifier-wrapped
/// body re-framed as chunked.
async fn stream_response_to_client(
    rt: &Arc<ProxyRuntime>,
    client: &mut BufferedConn<IoStream>,
    upstream: &mut BufferedConn<IoStream>,
    flow: &mut Flow,
    streaming: StreamingBody,
) -> io::Result<()> {
    let (status, mut headers, close) = match flow.response.as_ref() {
        Some(response) => (response.status, response.headers.clone(), response.close),
        None => (200, HeaderMap::new(), false),
    };
    headers.remove("content-length");
    headers.remove("transfer-encoding");
    headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
    if close {
        headers.insert("connection", HeaderValue::from_static("close"));
    }

    let head = serialize_response_head(
        HttpVersion::Http11,
        status,
        reason_phrase(status),
        &headers,
    );
    client.stream.write_all(&head).await?;

    let (pump_end, reader_end) = tokio::io::duplex(STREAM_PIPE_CAPACITY);
    let mut wrapped = rt
        .addons
        .wrap_response_reader(flow, Box::new(reader_end) as BodyReader);

    let (pump_result, send_result) = tokio::join!(
        pump_body(upstream, streaming, pump_end),
        copy_reader_as_chunks(&mut wrapped, &mut client.stream),
    );
    pump_result?;
    send_result?;
    Ok(())
}

/// Stage 8: write a buffered (or synthesized) response to the client.
async fn finish_with_response(
    client: &mut BufferedConn<IoStream>,
    flow: &mut Flow,
    force_close: bool,
) -> io::Result<Disposition> {
    let Some(response) = flow.response.as_mut() else {
        return Ok(Disposition::Done);
    };

    // A reader-backed synthetic body streams to the client as chunked.
    if response.body.is_none() && response.body_reader.is_some() {
        let mut reader = response.body_reader.take().expect("reader present");
        let mut headers = response.headers.clone();
        headers.remove("content-length");
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        let close = response.close || force_close;
        if close {
            headers.insert("connection", HeaderValue::from_static("close"));
        }
        let head = serialize_response_head(
            HttpVersion::Http11,
            response.status,
            reason_phrase(response.status),
            &headers,
        );
        client.stream.write_all(&head).await?;
        copy_reader_as_chunks(&mut reader, &mut client.stream).await?;
        if close {
            let _ = client.stream.shutdown().await;
            return Ok(Disposition::Done);
        }
        return Ok(Disposition::Continue);
    }

    let body = response.body.clone().unwrap_or_default();
    let mut headers = response.headers.clone();
    // HEAD, 1xx, 204, and 304 responses have no body by definition; the
    // origin's declared length (a HEAD response may state the GET size)
    // must survive instead of being rewritten to zero.
    let bodyless_by_definition = flow.request.method == "HEAD"
        || response.status / 100 == 1
        || response.status == 204
        || response.status == 304;
    if !(bodyless_by_definition && body.is_empty()) {
        headers.remove("transfer-encoding");
        headers.insert(
            "content-length",
            HeaderValue::from_str(&body.len().to_string()).expect("decimal length header"),
        );
    }
    let close = response.close || force_close;
    if close {
        headers.insert("connection", HeaderValue::from_static("close"));
    }

    let head = serialize_response_head(
        HttpVersion::Http11,
        response.status,
        reason_phrase(response.status),
        &headers,
    );
    client.stream.write_all(&head).await?;
    if !body.is_empty() {
        client.stream.write_all(&body).await?;
    }
    client.stream.flush().await?;

    if close {
        let _ = client.stream.shutdown().await;
        Ok(Disposition::Done)
    } else {
        Ok(Disposition::Continue)
    }
}

/// Transport failures surface to the client as 407 (credentials rejected
/// by the parent proxy) or 502; nothing else.
async fn respond_dial_failure(
    client: &mut BufferedConn<IoStream>,
    flow: &mut Flow,
    error: &io::Error,
    force_close: bool,
) -> io::Result<Disposition> {
    let message = error.to_string();
    let (status, extra): (u16, &[(&str, &str)]) =
        if message.to_ascii_lowercase().contains("proxy authentication required") {
            (407, &[("Proxy-Authenticate", "Basic realm=\"proxy\"")])
        } else {
            (502, &[])
        };
    debug!(%message, status, "upstream failure");

    let mut response = Response::with_body(status, Bytes::from(message.into_bytes()));
    for (name, value) in extra {
        response.headers.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).expect("static header name"),
            HeaderValue::from_str(value).expect("static header value"),
        );
    }
    response
        .headers
        .insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    flow.response = Some(response);
    finish_with_response(client, flow, force_close).await
}

/// Discards the unread request body of a short-circuited flow so keepalive
/// can continue. Returns false when the body was too large to drain.
pub(crate) async fn drain_request_body<S>(
    client: &mut BufferedConn<S>,
    mode: BodyMode,
) -> io::Result<bool>
where
    S: AsyncRead + Unpin,
{
    match mode {
        BodyMode::None | BodyMode::CloseDelimited => Ok(true),
        BodyMode::ContentLength(length) => {
            if length > DRAIN_CAP {
                return Ok(false);
            }
            let mut remaining = length;
            let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
            while remaining > 0 {
                let want = chunk.len().min(remaining as usize);
                let read = client.read_some(&mut chunk[..want]).await?;
                if read == 0 {
                    return Ok(false);
                }
                remaining -= read as u64;
            }
            Ok(true)
        }
        BodyMode::Chunked => {
            let mut drained = 0_u64;
            loop {
                let line = read_chunk_line(client).await?;
                let size = parse_chunk_size_line(&line)?;
                if size == 0 {
                    consume_chunked_trailers(client).await?;
                    return Ok(true);
                }
                drained += size;
                if drained > DRAIN_CAP {
                    return Ok(false);
                }
                let mut remaining = size;
                let mut chunk = [0_u8; crate::buffered::IO_CHUNK_SIZE];
                while remaining > 0 {
                    let want = chunk.len().min(remaining as usize);
                    let read = client.read_some(&mut chunk[..want]).await?;
                    if read == 0 {
                        return Ok(false);
                    }
                    remaining -= read as u64;
                }
                expect_chunk_terminator(client).await?;
            }
        }
    }
}

fn outbound_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn drop_upstream(
    rt: &Arc<ProxyRuntime>,
    cc: &Arc<ConnectionContext>,
    upstream: &mut Option<BufferedConn<IoStream>>,
    separate: Option<(String, BufferedConn<IoStream>)>,
) {
    if separate.is_none() && upstream.take().is_some() {
        rt.addons.server_disconnected(cc);
    }
    drop(separate);
}

fn checkin_separate(rt: &Arc<ProxyRuntime>, separate: Option<(String, BufferedConn<IoStream>)>) {
    if let Some((key, conn)) = separate {
        rt.pool.checkin(key, conn);
    }
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers.get_all(name).iter().any(|value| {
        value
            .to_str()
            .map(|text| {
                text.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

fn is_websocket_upgrade(request: &HeaderMap, response: &HeaderMap) -> bool {
    header_has_token(request, "upgrade", "websocket")
        && header_has_token(response, "upgrade", "websocket")
        && header_has_token(response, "connection", "upgrade")
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

/// Writes a proxy-originated plain-text response outside any flow.
pub(crate) async fn write_simple_response<W>(
    sink: &mut W,
    status: u16,
    extra_headers: &[(&str, &str)],
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {status} {}\r\n", reason_phrase(status));
    head.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    sink.write_all(head.as_bytes()).await?;
    sink.write_all(body.as_bytes()).await?;
    sink.flush().await
}

impl Request {
    /// POST/PUT/PATCH requests carry a length header even when empty.
    fn method_has_body(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT" | "PATCH")
    }
}

#[cfg(test)]
mod tests {
    use tapwire_http::BodyMode;

    use super::{read_body_with_threshold, FlowBody};
    use crate::buffered::BufferedConn;

    #[tokio::test]
    async fn body_equal_to_threshold_stays_buffered() {
        let body = vec![b'a'; 64];
        let mut conn = BufferedConn::new(body.as_slice());
        let result = read_body_with_threshold(&mut conn, BodyMode::ContentLength(64), 64)
            .await
            .expect("read");
        match result {
            FlowBody::Buffered(bytes) => assert_eq!(bytes.len(), 64),
            _ => panic!("expected buffered body"),
        }
    }

    #[tokio::test]
    async fn body_above_threshold_streams() {
        let body = vec![b'a'; 65];
        let mut conn = BufferedConn::new(body.as_slice());
        let result = read_body_with_threshold(&mut conn, BodyMode::ContentLength(65), 64)
            .await
            .expect("read");
        assert!(matches!(result, FlowBody::Streaming(_)));
    }

    #[tokio::test]
    async fn chunked_body_flips_to_streaming_when_count_crosses_threshold() {
        // Two 48-byte chunks; threshold 64 is crossed inside the second.
        let mut wire = Vec::new();
        wire.extend_from_slice(b"30\r\n");
        wire.extend_from_slice(&[b'x'; 48]);
        wire.extend_from_slice(b"\r\n30\r\n");
        wire.extend_from_slice(&[b'y'; 48]);
        wire.extend_from_slice(b"\r\n0\r\n\r\n");

        let mut conn = BufferedConn::new(wire.as_slice());
        let result = read_body_with_threshold(&mut conn, BodyMode::Chunked, 64)
            .await
            .expect("read");
        match result {
            FlowBody::Streaming(streaming) => {
                assert!(streaming.prefix.len() as u64 > 64);
            }
            _ => panic!("expected streaming flip"),
        }
    }

    #[tokio::test]
    async fn small_chunked_body_buffers_completely() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n");

        let mut conn = BufferedConn::new(wire.as_slice());
        let result = read_body_with_threshold(&mut conn, BodyMode::Chunked, 1024)
            .await
            .expect("read");
        match result {
            FlowBody::Buffered(bytes) => assert_eq!(bytes, b"hello world"),
            _ => panic!("expected buffered body"),
        }
    }
}
