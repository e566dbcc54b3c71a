//! From-scratch WebSocket server protocol: handshake computation and frame
//! encode/decode for the operator console channel.
//!
//! Server-to-client frames are never masked; client-to-server frames always
//! carry a 4-byte mask key. Continuation frames are unsupported: a frame with
//! FIN unset is dropped and the channel is treated as finished by callers.

use crate::error::ProxyError;
use crate::request::parse_headers;
use base64::{engine::general_purpose, Engine as _};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// RFC 6455 handshake GUID.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HANDSHAKE_RESPONSE: &str = "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: WebSocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: {accept}\r\n\r\n";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Perform the server side of the WebSocket handshake on a freshly accepted
/// socket: one bounded read, header parse, `101 Switching Protocols` reply.
/// A missing `Sec-WebSocket-Key` header is fatal for this connection only.
pub async fn handshake<S>(stream: &mut S, max_buffer: usize) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; max_buffer];
    let n = stream.read(&mut buf).await?;
    let headers = parse_headers(&buf[..n]);

    let key = headers
        .get(b"Sec-WebSocket-Key".as_slice())
        .ok_or_else(|| ProxyError::Handshake("missing Sec-WebSocket-Key header".to_string()))?;
    let key = std::str::from_utf8(key)
        .map_err(|e| ProxyError::Handshake(format!("invalid Sec-WebSocket-Key: {}", e)))?;

    let response = HANDSHAKE_RESPONSE.replace("{accept}", &accept_key(key));
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Encode a server-to-client text payload as a single frame.
///
/// `fin` must be 0 or 1 and reserved opcodes (`0x3..=0x7`, `>= 0xB`) are
/// rejected. The mask bit is always clear on server frames.
pub fn pack(payload: &str, fin: u8, opcode: u8) -> Result<Vec<u8>, ProxyError> {
    if fin > 1 {
        return Err(ProxyError::Protocol(
            "FIN bit parameter must be 0 or 1".to_string(),
        ));
    }
    if (0x3..=0x7).contains(&opcode) || opcode >= 0xB {
        return Err(ProxyError::Protocol(format!(
            "opcode {:#x} is reserved",
            opcode
        )));
    }

    let body = payload.as_bytes();
    let mut frame = Vec::with_capacity(body.len() + 10);
    frame.push((fin << 7) | opcode);
    if body.len() < 126 {
        frame.push(body.len() as u8);
    } else if body.len() < (1 << 16) {
        frame.push(126);
        frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(body.len() as u64).to_be_bytes());
    }
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Decode one client-to-server frame, returning the unmasked payload.
///
/// Only text frames (opcode 1) get the 126/127 extended-length handling; for
/// every other opcode the raw 7-bit field of the second header byte is used
/// as the length. Inherited protocol gap, kept as documented behavior.
///
/// Client frames always carry a mask key, so exactly 4 mask bytes are read
/// after the length field. Returns `Ok(Some(payload))` for a complete frame,
/// `Ok(None)` when FIN is unset (fragment, dropped), `Err` on socket or
/// header failure. Callers treat anything but a complete frame as the end of
/// the channel.
pub async fn unpack<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProxyError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0F;

    let mut length = u64::from(head[1] & 0x7F);
    if opcode == 0x1 {
        if length == 126 {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            length = u64::from(u16::from_be_bytes(ext));
        } else if length == 127 {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            length = u64::from_be_bytes(ext);
        }
    }

    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    if fin {
        Ok(Some(payload))
    } else {
        Ok(None)
    }
}
