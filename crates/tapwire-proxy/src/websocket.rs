use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::buffered::{BufferedConn, IoStream};
use crate::errors::log_transport_error;
use crate::flow::{Flow, MessageKind, WebSocketMessage};
use crate::runtime::ProxyRuntime;

const OPCODE_CONTINUATION: u8 = 0x0;
const CONTROL_MAX_PAYLOAD: u64 = 125;
const MAX_MESSAGE_BYTES: u64 = 64 * 1024 * 1024;

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
}

/// Takes ownership of both sockets after a confirmed `101` upgrade and
/// shuttles messages until either side closes. Every message passes through
/// the addon chain before it is forwarded; fragmented messages are
/// coalesced first, consistently in both directions.
pub(crate) async fn bridge(
    rt: Arc<ProxyRuntime>,
    flow: Flow,
    client: BufferedConn<IoStream>,
    upstream: BufferedConn<IoStream>,
) {
    rt.addons.websocket_handshake(&flow);
    let done = flow.done_handle();
    let flow = Arc::new(Mutex::new(flow));

    let BufferedConn {
        stream: client_stream,
        read_buf: client_prefix,
    } = client;
    let BufferedConn {
        stream: upstream_stream,
        read_buf: upstream_prefix,
    } = upstream;

    let (client_read, client_write) = tokio::io::split(client_stream);
    let (upstream_read, upstream_write) = tokio::io::split(upstream_stream);

    let client_task = tokio::spawn(relay_direction(
        Arc::clone(&rt),
        Arc::clone(&flow),
        true,
        BufferedConn::with_prefix(client_read, client_prefix),
        upstream_write,
    ));
    let server_task = tokio::spawn(relay_direction(
        Arc::clone(&rt),
        Arc::clone(&flow),
        false,
        BufferedConn::with_prefix(upstream_read, upstream_prefix),
        client_write,
    ));

    let (client_result, server_result) = tokio::join!(client_task, server_task);
    for result in [client_result, server_result] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log_transport_error("websocket_relay", &error),
            Err(join_error) => debug!(%join_error, "websocket direction task failed"),
        }
    }
    done.finish();
}

/// One direction of the shuttle. Returns after forwarding a close message,
/// on clean EOF, or on the first transport error; in every case the
/// forward sink is shut down so the peer direction unblocks.
async fn relay_direction(
    rt: Arc<ProxyRuntime>,
    flow: Arc<Mutex<Flow>>,
    from_client: bool,
    mut source: BufferedConn<ReadHalf<IoStream>>,
    mut dest: WriteHalf<IoStream>,
) -> io::Result<()> {
    // Frames toward upstream are client-role and must be masked.
    let mask_outgoing = from_client;
    let mut partial: Option<(MessageKind, Vec<u8>)> = None;

    loop {
        let frame = match read_frame(&mut source).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let _ = dest.shutdown().await;
                return Ok(());
            }
            Err(error) => {
                let _ = dest.shutdown().await;
                return Err(error);
            }
        };

        let Some((kind, data)) = assemble_message(frame, &mut partial)? else {
            continue;
        };

        let mut message = WebSocketMessage {
            kind,
            data,
            from_client,
        };
        {
            let guard = flow.lock().await;
            rt.addons.websocket_message(&guard, &mut message);
        }

        write_message(&mut dest, &message, mask_outgoing).await?;

        if message.kind == MessageKind::Close {
            let _ = dest.flush().await;
            return Ok(());
        }
    }
}

/// Folds a frame into the pending fragmented message. Control frames pass
/// through immediately, even between fragments.
fn assemble_message(
    frame: Frame,
    partial: &mut Option<(MessageKind, Vec<u8>)>,
) -> io::Result<Option<(MessageKind, Vec<u8>)>> {
    if frame.opcode == OPCODE_CONTINUATION {
        let Some((kind, mut data)) = partial.take() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "continuation frame without a message in progress",
            ));
        };
        if data.len() as u64 + frame.payload.len() as u64 > MAX_MESSAGE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "fragmented message exceeds size limit",
            ));
        }
        data.extend_from_slice(&frame.payload);
        if frame.fin {
            return Ok(Some((kind, data)));
        }
        *partial = Some((kind, data));
        return Ok(None);
    }

    let kind = MessageKind::from_opcode(frame.opcode).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("reserved websocket opcode {:#x}", frame.opcode),
        )
    })?;

    match kind {
        MessageKind::Text | MessageKind::Binary => {
            if frame.fin {
                Ok(Some((kind, frame.payload)))
            } else {
                if partial.is_some() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "interleaved fragmented messages",
                    ));
                }
                *partial = Some((kind, frame.payload));
                Ok(None)
            }
        }
        MessageKind::Close | MessageKind::Ping | MessageKind::Pong => {
            Ok(Some((kind, frame.payload)))
        }
    }
}

async fn read_frame<R>(source: &mut BufferedConn<R>) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    if !source.fill_at_least(2).await? {
        return Ok(None);
    }
    let header = source.read_exact_buffered(2).await?;
    let fin = header[0] & 0b1000_0000 != 0;
    let opcode = header[0] & 0b0000_1111;
    let masked = header[1] & 0b1000_0000 != 0;
    let mut payload_len = u64::from(header[1] & 0b0111_1111);

    let is_control = opcode & 0b1000 != 0;
    if is_control {
        if !fin {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "fragmented websocket control frame",
            ));
        }
        if payload_len > CONTROL_MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "websocket control frame payload exceeds 125 bytes",
            ));
        }
    }

    if payload_len == 126 {
        let ext = source.read_exact_buffered(2).await?;
        payload_len = u64::from(u16::from_be_bytes([ext[0], ext[1]]));
    } else if payload_len == 127 {
        let ext = source.read_exact_buffered(8).await?;
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(&ext);
        payload_len = u64::from_be_bytes(bytes);
        if payload_len & (1 << 63) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "websocket payload length uses the reserved high bit",
            ));
        }
    }
    if payload_len > MAX_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "websocket frame exceeds size limit",
        ));
    }

    let masking_key = if masked {
        let key = source.read_exact_buffered(4).await?;
        let mut bytes = [0_u8; 4];
        bytes.copy_from_slice(&key);
        Some(bytes)
    } else {
        None
    };

    let mut payload = source.read_exact_buffered(payload_len as usize).await?;
    if let Some(key) = masking_key {
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[index % 4];
        }
    }

    Ok(Some(Frame {
        fin,
        opcode,
        payload,
    }))
}

/// Writes one message as a single unfragmented frame.
async fn write_message<W>(
    dest: &mut W,
    message: &WebSocketMessage,
    mask: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload_len = message.data.len();
    let mut header = Vec::with_capacity(14);
    header.push(0b1000_0000 | message.kind.opcode());

    let mask_bit = if mask { 0b1000_0000 } else { 0 };
    if payload_len < 126 {
        header.push(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    if mask {
        let key: [u8; 4] = rand::random();
        header.extend_from_slice(&key);
        dest.write_all(&header).await?;
        let mut masked_payload = message.data.clone();
        for (index, byte) in masked_payload.iter_mut().enumerate() {
            *byte ^= key[index % 4];
        }
        dest.write_all(&masked_payload).await?;
    } else {
        dest.write_all(&header).await?;
        dest.write_all(&message.data).await?;
    }
    dest.flush().await
}
