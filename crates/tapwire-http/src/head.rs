use std::io;

use http::header::{HeaderMap, HeaderName, HeaderValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// How the message body after a head is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("request headers were not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| invalid_data("request line is missing"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| invalid_data("request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| invalid_data("request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(invalid_data("request line had too many fields"));
    }
    let version = parse_version(version_text)?;

    let headers = parse_headers(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method: method.to_ascii_uppercase(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| invalid_data("response headers were not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| invalid_data("response status line is missing"))?;

    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| invalid_data("response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| invalid_data("response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| invalid_data("invalid response status code"))?;

    let headers = parse_headers(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut connection_close = is_connection_close(version, &headers);
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn serialize_request_head(
    method: &str,
    target: &str,
    version: HttpVersion,
    headers: &HeaderMap,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.as_str().as_bytes());
    out.extend_from_slice(b"\r\n");
    serialize_headers(&mut out, headers);
    out.extend_from_slice(b"\r\n");
    out
}

pub fn serialize_response_head(
    version: HttpVersion,
    status: u16,
    reason: &str,
    headers: &HeaderMap,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(version.as_str().as_bytes());
    out.extend_from_slice(format!(" {status}").as_bytes());
    if !reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    serialize_headers(&mut out, headers);
    out.extend_from_slice(b"\r\n");
    out
}

fn serialize_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// Hop-by-hop headers are stripped before a request is replayed upstream.
pub fn is_hop_by_hop(name: &str) -> bool {
    const HOP_BY_HOP: [&str; 6] = [
        "connection",
        "upgrade",
        "keep-alive",
        "trailer",
        "transfer-encoding",
        "te",
    ];
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("proxy-")
}

/// Parses the hex size prefix of a chunk-size line (extensions ignored).
pub fn parse_chunk_size_line(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| invalid_data("chunk size line was not valid UTF-8"))?;
    let size_text = text
        .trim_end_matches("\r\n")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size_text, 16).map_err(|_| invalid_data("invalid chunk size"))
}

fn parse_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(invalid_data(
            "only HTTP/1.0 and HTTP/1.1 are supported on the intercepted path",
        )),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data("malformed header line"))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid_data("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderMap) -> io::Result<BodyMode> {
    if has_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) | None => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
    }
}

fn response_body_mode(
    headers: &HeaderMap,
    request_method: &str,
    status: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || status / 100 == 1
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::None);
    }
    if has_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match content_length(headers)? {
        Some(0) => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
        None => Ok(BodyMode::CloseDelimited),
    }
}

fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let Some(value) = headers.get("content-length") else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| invalid_data("content-length was not valid UTF-8"))?;
    text.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| invalid_data("invalid content-length"))
}

fn has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
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

fn is_connection_close(version: HttpVersion, headers: &HeaderMap) -> bool {
    if has_token(headers, "connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !has_token(headers, "connection", "keep-alive")
}

fn invalid_data(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
