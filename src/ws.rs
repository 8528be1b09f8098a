//! Client-side WebSocket framing (RFC 6455).
//!
//! Only what the NDT dialect needs: the HTTP/1.1 upgrade against the fixed
//! `/ndt_protocol` path, masked client-to-server frames, transparent
//! PING/PONG and CLOSE handling, and message reassembly from continuation
//! frames. Frames arriving from the server must be unmasked and must not
//! set any reserved bit.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::net::Conn;
use crate::params;

/// Continuation-frame opcode.
pub const OP_CONTINUE: u8 = 0;
/// Text-frame opcode.
pub const OP_TEXT: u8 = 1;
/// Binary-frame opcode.
pub const OP_BINARY: u8 = 2;
/// Close-frame opcode.
pub const OP_CLOSE: u8 = 8;
/// Ping-frame opcode.
pub const OP_PING: u8 = 9;
/// Pong-frame opcode.
pub const OP_PONG: u8 = 10;

/// FIN bit in the first frame octet.
pub const FIN_FLAG: u8 = 0x80;
/// Reserved bits in the first frame octet; must be zero.
pub const RESERVED_MASK: u8 = 0x70;
/// Opcode bits in the first frame octet.
pub const OPCODE_MASK: u8 = 0x0f;
/// Mask bit in the second frame octet.
pub const MASK_FLAG: u8 = 0x80;
/// Payload-length bits in the second frame octet.
pub const LEN_MASK: u8 = 0x7f;

/// Handshake requirement: the response must carry `Connection: Upgrade`.
pub const F_CONNECTION: u8 = 1 << 0;
/// Handshake requirement: the response must carry a valid accept key.
pub const F_SEC_WS_ACCEPT: u8 = 1 << 1;
/// Handshake requirement: the response must echo our subprotocol.
pub const F_SEC_WS_PROTOCOL: u8 = 1 << 2;
/// Handshake requirement: the response must carry `Upgrade: websocket`.
pub const F_UPGRADE: u8 = 1 << 3;
/// All handshake requirements at once; used for the control connection.
pub const F_ALL: u8 = F_CONNECTION | F_SEC_WS_ACCEPT | F_SEC_WS_PROTOCOL | F_UPGRADE;

// Bound on a single HTTP header line during the upgrade.
const MAX_LINE: usize = 8192;

/// Upgrade an open connection to WebSocket.
///
/// `flags` selects which response headers are required (`F_*`);
/// `protocol` goes out as `Sec-WebSocket-Protocol` and, when required,
/// must be echoed back verbatim. Any deviation is [`Error::WsProto`].
pub async fn handshake<S>(
    conn: &mut Conn<S>,
    hostname: &str,
    port: &str,
    flags: u8,
    protocol: &str,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let nonce: [u8; 16] = rand::rng().random();
    let key = BASE64.encode(nonce);
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {}\r\n\
         \r\n",
        params::WS_REQUEST_PATH,
        hostname,
        port,
        key,
        protocol
    );
    conn.sendn(request.as_bytes()).await?;

    let status = recv_line(conn).await?;
    if !status.starts_with("HTTP/1.1 101") {
        return Err(Error::WsProto);
    }

    let mut seen = 0u8;
    loop {
        let line = recv_line(conn).await?;
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::WsProto);
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "connection" if flags & F_CONNECTION != 0 => {
                if !value.eq_ignore_ascii_case("upgrade") {
                    return Err(Error::WsProto);
                }
                seen |= F_CONNECTION;
            }
            "upgrade" if flags & F_UPGRADE != 0 => {
                if !value.eq_ignore_ascii_case("websocket") {
                    return Err(Error::WsProto);
                }
                seen |= F_UPGRADE;
            }
            "sec-websocket-accept" if flags & F_SEC_WS_ACCEPT != 0 => {
                if value != accept_key(&key) {
                    return Err(Error::WsProto);
                }
                seen |= F_SEC_WS_ACCEPT;
            }
            "sec-websocket-protocol" if flags & F_SEC_WS_PROTOCOL != 0 => {
                if value != protocol {
                    return Err(Error::WsProto);
                }
                seen |= F_SEC_WS_PROTOCOL;
            }
            _ => {}
        }
    }
    if seen != flags {
        return Err(Error::WsProto);
    }
    Ok(())
}

/// The `Sec-WebSocket-Accept` value the server must produce for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(params::WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

// Read one CRLF-terminated header line, byte by byte so no frame data is
// consumed past the blank separator.
async fn recv_line<S>(conn: &mut Conn<S>) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        conn.recvn(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE {
            return Err(Error::WsProto);
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|_| Error::WsProto)
}

fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[index % 4];
    }
}

fn is_control(opcode: u8) -> bool {
    opcode & 0x8 != 0
}

/// Send one masked frame; `first_byte` carries the FIN flag and opcode.
pub async fn send_frame<S>(conn: &mut Conn<S>, first_byte: u8, payload: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = payload.len();
    if is_control(first_byte & OPCODE_MASK) && length > 125 {
        return Err(Error::InvalidArgument);
    }
    let mask: [u8; 4] = rand::rng().random();
    let mut frame = Vec::with_capacity(length + 14);
    frame.push(first_byte);
    if length <= 125 {
        frame.push(MASK_FLAG | length as u8);
    } else if length <= 65535 {
        frame.push(MASK_FLAG | 126);
        frame.extend_from_slice(&(length as u16).to_be_bytes());
    } else {
        frame.push(MASK_FLAG | 127);
        frame.extend_from_slice(&(length as u64).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    let body_start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[body_start..], mask);
    conn.sendn(&frame).await
}

/// Send a CLOSE frame with the given status code payload.
pub async fn send_close<S>(conn: &mut Conn<S>, status: &[u8]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_frame(conn, FIN_FLAG | OP_CLOSE, status).await
}

/// Read one raw frame, returning `(opcode, fin, payload)`.
///
/// Rejects reserved bits, unknown opcodes, masked server frames,
/// fragmented control frames, and oversized payloads.
pub async fn recv_any_frame<S>(conn: &mut Conn<S>) -> Result<(u8, bool, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    conn.recvn(&mut header).await?;
    if header[0] & RESERVED_MASK != 0 {
        return Err(Error::WsProto);
    }
    let fin = header[0] & FIN_FLAG != 0;
    let opcode = header[0] & OPCODE_MASK;
    if !matches!(opcode, OP_CONTINUE | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG) {
        return Err(Error::WsProto);
    }
    // Server-to-client frames are never masked.
    if header[1] & MASK_FLAG != 0 {
        return Err(Error::WsProto);
    }
    let mut length = u64::from(header[1] & LEN_MASK);
    if length == 126 {
        let mut ext = [0u8; 2];
        conn.recvn(&mut ext).await?;
        length = u64::from(u16::from_be_bytes(ext));
    } else if length == 127 {
        let mut ext = [0u8; 8];
        conn.recvn(&mut ext).await?;
        length = u64::from_be_bytes(ext);
        if length & (1 << 63) != 0 {
            return Err(Error::WsProto);
        }
    }
    if is_control(opcode) && (!fin || length > 125) {
        return Err(Error::WsProto);
    }
    if length > params::MAX_WS_MESSAGE as u64 {
        return Err(Error::MessageSize);
    }
    let mut payload = vec![0u8; length as usize];
    conn.recvn(&mut payload).await?;
    Ok((opcode, fin, payload))
}

/// Read one data frame, transparently answering PING, discarding PONG and
/// echoing CLOSE.
///
/// A CLOSE from the server terminates the stream as [`Error::Eof`] after
/// the close has been echoed back with the peer's status code.
pub async fn recv_frame<S>(conn: &mut Conn<S>) -> Result<(u8, bool, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let (opcode, fin, payload) = recv_any_frame(conn).await?;
        match opcode {
            OP_PING => send_frame(conn, FIN_FLAG | OP_PONG, &payload).await?,
            OP_PONG => {}
            OP_CLOSE => {
                let status = if payload.len() >= 2 { &payload[..2] } else { &[][..] };
                send_close(conn, status).await?;
                return Err(Error::Eof);
            }
            _ => return Ok((opcode, fin, payload)),
        }
    }
}

/// Read one whole message, reassembling continuation frames.
///
/// The first frame must carry a data opcode; every following frame until
/// FIN must be a continuation.
pub async fn recv_message<S>(conn: &mut Conn<S>) -> Result<(u8, Vec<u8>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (opcode, mut fin, mut message) = recv_frame(conn).await?;
    if opcode == OP_CONTINUE {
        return Err(Error::WsProto);
    }
    while !fin {
        let (next, next_fin, payload) = recv_frame(conn).await?;
        if next != OP_CONTINUE {
            return Err(Error::WsProto);
        }
        message.extend_from_slice(&payload);
        if message.len() > params::MAX_WS_MESSAGE {
            return Err(Error::MessageSize);
        }
        fin = next_fin;
    }
    Ok((opcode, message))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    fn conn(stream: DuplexStream) -> Conn<DuplexStream> {
        Conn::new(stream, Duration::from_secs(1))
    }

    // Unmasked server-side frame with inline length.
    fn server_frame(first_byte: u8, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 125);
        let mut frame = vec![first_byte, payload.len() as u8];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn accept_key_matches_rfc_vector() {
        // The example from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn masking_twice_is_identity() {
        let original = b"The quick brown fox".to_vec();
        let mask = [0xde, 0xad, 0xbe, 0xef];
        let mut payload = original.clone();
        apply_mask(&mut payload, mask);
        assert_ne!(payload, original);
        apply_mask(&mut payload, mask);
        assert_eq!(payload, original);
    }

    async fn sent_frame(payload_len: usize) -> Vec<u8> {
        let (client, mut server) = tokio::io::duplex(payload_len + 64);
        let mut conn = conn(client);
        let payload = vec![0xaa; payload_len];
        send_frame(&mut conn, FIN_FLAG | OP_BINARY, &payload)
            .await
            .unwrap();
        drop(conn);
        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn frame_lengths_use_the_minimal_form() {
        let raw = sent_frame(125).await;
        assert_eq!(raw[1], MASK_FLAG | 125);
        assert_eq!(raw.len(), 2 + 4 + 125);

        let raw = sent_frame(126).await;
        assert_eq!(raw[1], MASK_FLAG | 126);
        assert_eq!(&raw[2..4], &126u16.to_be_bytes());
        assert_eq!(raw.len(), 4 + 4 + 126);

        let raw = sent_frame(127).await;
        assert_eq!(raw[1], MASK_FLAG | 126);
        assert_eq!(&raw[2..4], &127u16.to_be_bytes());

        let raw = sent_frame(65535).await;
        assert_eq!(raw[1], MASK_FLAG | 126);
        assert_eq!(&raw[2..4], &65535u16.to_be_bytes());

        let raw = sent_frame(65536).await;
        assert_eq!(raw[1], MASK_FLAG | 127);
        assert_eq!(&raw[2..10], &65536u64.to_be_bytes());
        assert_eq!(raw.len(), 10 + 4 + 65536);
    }

    #[tokio::test]
    async fn sent_frames_are_masked_and_recoverable() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        send_frame(&mut conn, FIN_FLAG | OP_TEXT, b"hello").await.unwrap();

        let mut raw = [0u8; 11];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw[0], FIN_FLAG | OP_TEXT);
        assert_eq!(raw[1], MASK_FLAG | 5);
        let mask = [raw[2], raw[3], raw[4], raw[5]];
        let mut payload = raw[6..].to_vec();
        assert_ne!(payload, b"hello");
        apply_mask(&mut payload, mask);
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn reserved_bits_are_rejected() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server
            .write_all(&server_frame(FIN_FLAG | 0x40 | OP_BINARY, b"x"))
            .await
            .unwrap();
        assert_eq!(recv_any_frame(&mut conn).await.unwrap_err(), Error::WsProto);
    }

    #[tokio::test]
    async fn masked_server_frames_are_rejected() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server
            .write_all(&[FIN_FLAG | OP_BINARY, MASK_FLAG | 1, 0, 0, 0, 0, 0xff])
            .await
            .unwrap();
        assert_eq!(recv_any_frame(&mut conn).await.unwrap_err(), Error::WsProto);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server
            .write_all(&server_frame(FIN_FLAG | OP_PING, b"probe"))
            .await
            .unwrap();
        server
            .write_all(&server_frame(FIN_FLAG | OP_BINARY, b"data"))
            .await
            .unwrap();

        let (opcode, fin, payload) = recv_frame(&mut conn).await.unwrap();
        assert_eq!((opcode, fin), (OP_BINARY, true));
        assert_eq!(payload, b"data");

        // The pong echoes the ping payload, masked.
        let mut pong = [0u8; 11];
        server.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong[0], FIN_FLAG | OP_PONG);
        assert_eq!(pong[1], MASK_FLAG | 5);
        let mask = [pong[2], pong[3], pong[4], pong[5]];
        let mut payload = pong[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(payload, b"probe");
    }

    #[tokio::test]
    async fn close_is_echoed_and_ends_the_stream() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server
            .write_all(&server_frame(FIN_FLAG | OP_CLOSE, &1000u16.to_be_bytes()))
            .await
            .unwrap();

        assert_eq!(recv_frame(&mut conn).await.unwrap_err(), Error::Eof);

        let mut close = [0u8; 8];
        server.read_exact(&mut close).await.unwrap();
        assert_eq!(close[0], FIN_FLAG | OP_CLOSE);
        assert_eq!(close[1], MASK_FLAG | 2);
        let mask = [close[2], close[3], close[4], close[5]];
        let mut status = close[6..].to_vec();
        apply_mask(&mut status, mask);
        assert_eq!(status, 1000u16.to_be_bytes());
    }

    #[tokio::test]
    async fn continuations_are_reassembled() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server
            .write_all(&server_frame(OP_TEXT, b"hello "))
            .await
            .unwrap();
        server
            .write_all(&server_frame(FIN_FLAG | OP_CONTINUE, b"world"))
            .await
            .unwrap();

        let (opcode, message) = recv_message(&mut conn).await.unwrap();
        assert_eq!(opcode, OP_TEXT);
        assert_eq!(message, b"hello world");
    }

    #[tokio::test]
    async fn leading_continuation_is_a_protocol_error() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server
            .write_all(&server_frame(FIN_FLAG | OP_CONTINUE, b"orphan"))
            .await
            .unwrap();
        assert_eq!(recv_message(&mut conn).await.unwrap_err(), Error::WsProto);
    }

    #[tokio::test]
    async fn non_continuation_mid_message_is_a_protocol_error() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = conn(client);
        server.write_all(&server_frame(OP_BINARY, b"a")).await.unwrap();
        server
            .write_all(&server_frame(FIN_FLAG | OP_BINARY, b"b"))
            .await
            .unwrap();
        assert_eq!(recv_message(&mut conn).await.unwrap_err(), Error::WsProto);
    }

    async fn upgrade_script(mut peer: DuplexStream, protocol: &str) {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            peer.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("GET /ndt_protocol HTTP/1.1\r\n"));
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             Sec-WebSocket-Protocol: {}\r\n\
             \r\n",
            accept_key(key),
            protocol
        );
        peer.write_all(response.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn handshake_succeeds_against_a_conforming_server() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = conn(client);
        let script = tokio::spawn(upgrade_script(server, "ndt"));
        handshake(&mut conn, "ndt.example.org", "3001", F_ALL, "ndt")
            .await
            .unwrap();
        script.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_rejects_a_wrong_subprotocol_echo() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = conn(client);
        let script = tokio::spawn(upgrade_script(server, "s2c"));
        let err = handshake(&mut conn, "ndt.example.org", "3001", F_ALL, "ndt")
            .await
            .unwrap_err();
        assert_eq!(err, Error::WsProto);
        script.await.unwrap();
    }
}
