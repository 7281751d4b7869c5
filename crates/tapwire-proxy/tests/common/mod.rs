#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tapwire_proxy::{
    Addon, BodyReader, CertAuthority, Flow, Options, Proxy, ProxyHandle, WebSocketMessage,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Starts a proxy with an in-memory root on an ephemeral port.
pub async fn spawn_proxy(
    mut options: Options,
    addons: Vec<Box<dyn Addon>>,
) -> (SocketAddr, ProxyHandle, String) {
    options.addr = "127.0.0.1:0".to_string();
    let authority = CertAuthority::in_memory().expect("in-memory authority");
    let mut proxy = Proxy::with_authority(options, authority).expect("proxy");
    for addon in addons {
        proxy.add_addon(addon);
    }
    let root_pem = proxy.root_cert_pem().to_string();
    let handle = proxy.shutdown_handle();

    let bound = proxy.bind().await.expect("bind");
    let addr = bound.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = bound.serve().await;
    });
    (addr, handle, root_pem)
}

/// Records the order of flow hooks; shared by most scenarios.
#[derive(Default)]
pub struct RecordingAddon {
    pub log: Arc<Mutex<Vec<String>>>,
}

impl RecordingAddon {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }

    fn push(&self, entry: impl Into<String>) {
        self.log.lock().expect("log lock").push(entry.into());
    }
}

impl Addon for RecordingAddon {
    fn request_headers(&self, _flow: &mut Flow) {
        self.push("request_headers");
    }

    fn request(&self, _flow: &mut Flow) {
        self.push("request");
    }

    fn response_headers(&self, _flow: &mut Flow) {
        self.push("response_headers");
    }

    fn response(&self, _flow: &mut Flow) {
        self.push("response");
    }

    fn stream_request_modifier(&self, _flow: &Flow, reader: BodyReader) -> BodyReader {
        self.push("stream_request_modifier");
        reader
    }

    fn stream_response_modifier(&self, _flow: &Flow, reader: BodyReader) -> BodyReader {
        self.push("stream_response_modifier");
        reader
    }

    fn websocket_handshake(&self, _flow: &Flow) {
        self.push("websocket_handshake");
    }

    fn websocket_message(&self, _flow: &Flow, message: &mut WebSocketMessage) {
        self.push(format!(
            "websocket_message from_client={} data={}",
            message.from_client,
            String::from_utf8_lossy(&message.data)
        ));
    }
}

/// One parsed request as the stub upstream saw it.
pub struct StubRequest {
    pub head: String,
    pub body: Vec<u8>,
}

/// A minimal HTTP/1.1 upstream: for every request on every connection the
/// handler produces the raw response bytes. Bodies are read by
/// content-length or chunked framing.
pub async fn spawn_http_stub<F>(handler: F) -> SocketAddr
where
    F: Fn(StubRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("stub bind");
    let addr = listener.local_addr().expect("stub addr");
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let Some(request) = read_stub_request(&mut stream).await else {
                        return;
                    };
                    let response = handler(request);
                    if stream.write_all(&response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

async fn read_stub_request(stream: &mut TcpStream) -> Option<StubRequest> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    let head_end = loop {
        if let Some(position) = find(&buffer, b"\r\n\r\n") {
            break position + 4;
        }
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut body = buffer.split_off(head_end);

    if let Some(length) = header_value(&head, "content-length").and_then(|v| v.parse::<usize>().ok())
    {
        while body.len() < length {
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            body.extend_from_slice(&chunk[..read]);
        }
        body.truncate(length);
        return Some(StubRequest { head, body });
    }

    if header_value(&head, "transfer-encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        let decoded = read_chunked_body(stream, body).await?;
        return Some(StubRequest {
            head,
            body: decoded,
        });
    }

    Some(StubRequest { head, body })
}

async fn read_chunked_body(stream: &mut TcpStream, mut pending: Vec<u8>) -> Option<Vec<u8>> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let line_end = loop {
            if let Some(position) = find(&pending, b"\r\n") {
                break position;
            }
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            pending.extend_from_slice(&chunk[..read]);
        };
        let size_text = String::from_utf8_lossy(&pending[..line_end]).to_string();
        let size = usize::from_str_radix(size_text.split(';').next()?.trim(), 16).ok()?;
        pending.drain(..line_end + 2);

        while pending.len() < size + 2 {
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            pending.extend_from_slice(&chunk[..read]);
        }
        decoded.extend_from_slice(&pending[..size]);
        pending.drain(..size + 2);

        if size == 0 {
            return Some(decoded);
        }
    }
}

pub fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Reads one full HTTP response off a client connection, driven by
/// content-length or chunked framing.
pub async fn read_response<S>(stream: &mut S) -> (String, Vec<u8>)
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    let head_end = loop {
        if let Some(position) = find(&buffer, b"\r\n\r\n") {
            break position + 4;
        }
        let read = stream.read(&mut chunk).await.expect("response read");
        assert!(read > 0, "connection closed before response head");
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut body = buffer.split_off(head_end);

    if let Some(length) = header_value(&head, "content-length").and_then(|v| v.parse::<usize>().ok())
    {
        while body.len() < length {
            let read = stream.read(&mut chunk).await.expect("body read");
            assert!(read > 0, "connection closed before response body");
            body.extend_from_slice(&chunk[..read]);
        }
        body.truncate(length);
        return (head, body);
    }

    if header_value(&head, "transfer-encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        let mut decoded = Vec::new();
        loop {
            let line_end = loop {
                if let Some(position) = find(&body, b"\r\n") {
                    break position;
                }
                let read = stream.read(&mut chunk).await.expect("chunk read");
                assert!(read > 0, "connection closed mid-chunk");
                body.extend_from_slice(&chunk[..read]);
            };
            let size_text = String::from_utf8_lossy(&body[..line_end]).to_string();
            let size = usize::from_str_radix(size_text.split(';').next().unwrap().trim(), 16)
                .expect("chunk size");
            body.drain(..line_end + 2);
            while body.len() < size + 2 {
                let read = stream.read(&mut chunk).await.expect("chunk body read");
                assert!(read > 0, "connection closed mid-chunk");
                body.extend_from_slice(&chunk[..read]);
            }
            decoded.extend_from_slice(&body[..size]);
            body.drain(..size + 2);
            if size == 0 {
                return (head, decoded);
            }
        }
    }

    (head, body)
}

pub fn status_of(head: &str) -> u16 {
    head.split_whitespace()
        .nth(1)
        .and_then(|text| text.parse().ok())
        .expect("status code")
}

/// Test-side WebSocket frame helpers (single unfragmented frames).
pub async fn write_ws_frame<S>(stream: &mut S, opcode: u8, payload: &[u8], mask: Option<[u8; 4]>)
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut frame = vec![0b1000_0000 | opcode];
    let mask_bit = if mask.is_some() { 0b1000_0000 } else { 0 };
    if payload.len() < 126 {
        frame.push(mask_bit | payload.len() as u8);
    } else {
        frame.push(mask_bit | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| byte ^ key[index % 4]),
            );
        }
        None => frame.extend_from_slice(payload),
    }
    stream.write_all(&frame).await.expect("frame write");
    stream.flush().await.expect("frame flush");
}

pub async fn read_ws_frame<S>(stream: &mut S) -> (u8, Vec<u8>)
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0_u8; 2];
    stream.read_exact(&mut header).await.expect("frame header");
    let opcode = header[0] & 0x0f;
    let masked = header[1] & 0b1000_0000 != 0;
    let mut length = u64::from(header[1] & 0b0111_1111);
    if length == 126 {
        let mut ext = [0_u8; 2];
        stream.read_exact(&mut ext).await.expect("extended length");
        length = u64::from(u16::from_be_bytes(ext));
    } else if length == 127 {
        let mut ext = [0_u8; 8];
        stream.read_exact(&mut ext).await.expect("extended length");
        length = u64::from_be_bytes(ext);
    }
    let key = if masked {
        let mut key = [0_u8; 4];
        stream.read_exact(&mut key).await.expect("mask key");
        Some(key)
    } else {
        None
    };
    let mut payload = vec![0_u8; length as usize];
    stream.read_exact(&mut payload).await.expect("payload");
    if let Some(key) = key {
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[index % 4];
        }
    }
    (opcode, payload)
}
