use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

pub(crate) const IO_CHUNK_SIZE: usize = 16 * 1024;

/// Boxed bidirectional stream: a plain TCP socket or a TLS session.
pub(crate) type IoStream = Box<dyn Stream>;

pub(crate) trait Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> Stream for T {}

/// A stream plus bytes already read past the last parsed boundary.
pub(crate) struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub(crate) fn with_prefix(stream: S, prefix: Vec<u8>) -> Self {
        Self {
            stream,
            read_buf: prefix,
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Reads until `pattern` appears, returning everything up to and
    /// including it. `Ok(None)` means clean EOF before any bytes arrived.
    pub(crate) async fn read_until_pattern(
        &mut self,
        pattern: &[u8],
        max_bytes: usize,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, pattern) {
                let end = start + pattern.len();
                let bytes = self.read_buf.drain(..end).collect::<Vec<_>>();
                return Ok(Some(bytes));
            }

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                ));
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before message boundary",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Ensures at least `count` buffered bytes, without consuming them.
    /// Returns false on clean EOF before the first byte.
    pub(crate) async fn fill_at_least(&mut self, count: usize) -> io::Result<bool> {
        while self.read_buf.len() < count {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-record",
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(true)
    }

    /// Consumes exactly `count` bytes, from the buffer first.
    pub(crate) async fn read_exact_buffered(&mut self, count: usize) -> io::Result<Vec<u8>> {
        if !self.fill_at_least(count).await? {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before expected bytes",
            ));
        }
        Ok(self.read_buf.drain(..count).collect())
    }

    /// Reads some bytes, serving buffered data first. Zero means EOF.
    pub(crate) async fn read_some(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.read_buf.is_empty() {
            let take = out.len().min(self.read_buf.len());
            out[..take].copy_from_slice(&self.read_buf[..take]);
            self.read_buf.drain(..take);
            return Ok(take);
        }
        self.stream.read(out).await
    }
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Replays a prefix before delegating to the inner stream. Used to hand a
/// TLS acceptor the ClientHello bytes that were already peeked off the
/// socket.
pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
