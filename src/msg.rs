//! NDT control-message framing.
//!
//! A control message is `type (u8) || length (u16 big-endian) || body`.
//! In JSON mode the body is the object `{"msg": "<text>"}`; when the
//! WebSocket layer is active, every record travels as exactly one binary
//! WebSocket message.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::net::Conn;
use crate::params;
use crate::ws;

/// NDT control-message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Unrecoverable server-side failure.
    CommFailure = 0,
    /// Queue position / readiness signal.
    SrvQueue = 1,
    /// Login (and, from the server, version and suite announcements).
    Login = 2,
    /// A subtest is about to run; carries its parameters.
    TestPrepare = 3,
    /// A subtest starts now.
    TestStart = 4,
    /// Subtest payload message.
    TestMsg = 5,
    /// A subtest is over.
    TestFinalize = 6,
    /// Server-reported error.
    Error = 7,
    /// Final variables block.
    Results = 8,
    /// End of session.
    Logout = 9,
    /// Keepalive from a queued client.
    Waiting = 10,
    /// JSON-mode login.
    ExtendedLogin = 11,
}

impl MsgType {
    /// Parse a wire byte into a message type.
    pub fn from_u8(value: u8) -> Option<MsgType> {
        match value {
            0 => Some(MsgType::CommFailure),
            1 => Some(MsgType::SrvQueue),
            2 => Some(MsgType::Login),
            3 => Some(MsgType::TestPrepare),
            4 => Some(MsgType::TestStart),
            5 => Some(MsgType::TestMsg),
            6 => Some(MsgType::TestFinalize),
            7 => Some(MsgType::Error),
            8 => Some(MsgType::Results),
            9 => Some(MsgType::Logout),
            10 => Some(MsgType::Waiting),
            11 => Some(MsgType::ExtendedLogin),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct JsonBodyRef<'a> {
    msg: &'a str,
}

#[derive(Deserialize)]
struct JsonBody {
    msg: String,
}

/// Encode one legacy record. Bodies longer than 65535 octets do not fit
/// the 16-bit length field.
pub fn encode(kind: MsgType, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > params::MAX_MSG_SIZE {
        return Err(Error::MessageSize);
    }
    let mut record = Vec::with_capacity(3 + body.len());
    record.push(kind as u8);
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(body);
    Ok(record)
}

/// A connection speaking framed NDT messages in the negotiated mode.
pub struct Channel<S> {
    conn: Conn<S>,
    json: bool,
    websocket: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Channel<S> {
    /// Wrap an established transport.
    pub fn new(conn: Conn<S>, json: bool, websocket: bool) -> Self {
        Channel { conn, json, websocket }
    }

    /// Direct access to the transport, for the kickoff banner and teardown.
    pub fn conn_mut(&mut self) -> &mut Conn<S> {
        &mut self.conn
    }

    /// Frame and send one message.
    pub async fn msg_write(&mut self, kind: MsgType, body: &str) -> Result<()> {
        let body = if self.json {
            serde_json::to_string(&JsonBodyRef { msg: body }).map_err(|_| Error::InvalidArgument)?
        } else {
            body.to_owned()
        };
        let record = encode(kind, body.as_bytes())?;
        if self.websocket {
            ws::send_frame(&mut self.conn, ws::FIN_FLAG | ws::OP_BINARY, &record).await
        } else {
            self.conn.sendn(&record).await
        }
    }

    /// Read one message, returning its type and decoded body text.
    pub async fn msg_read(&mut self) -> Result<(MsgType, String)> {
        let (kind, raw) = self.msg_read_legacy().await?;
        if !self.json {
            let body = String::from_utf8(raw).map_err(|_| Error::WsProto)?;
            return Ok((kind, body));
        }
        let body: JsonBody = serde_json::from_slice(&raw).map_err(|_| Error::WsProto)?;
        Ok((kind, body.msg))
    }

    async fn msg_read_legacy(&mut self) -> Result<(MsgType, Vec<u8>)> {
        if self.websocket {
            // One WebSocket message carries exactly one NDT record.
            let (_opcode, message) = ws::recv_message(&mut self.conn).await?;
            if message.len() < 3 {
                return Err(Error::WsProto);
            }
            let kind = MsgType::from_u8(message[0]).ok_or(Error::WsProto)?;
            let length = u16::from_be_bytes([message[1], message[2]]) as usize;
            if message.len() != 3 + length {
                return Err(Error::WsProto);
            }
            Ok((kind, message[3..].to_vec()))
        } else {
            let mut header = [0u8; 3];
            self.conn.recvn(&mut header).await?;
            let kind = MsgType::from_u8(header[0]).ok_or(Error::WsProto)?;
            let length = u16::from_be_bytes([header[1], header[2]]) as usize;
            let mut body = vec![0u8; length];
            self.conn.recvn(&mut body).await?;
            Ok((kind, body))
        }
    }

    /// Read one message that must be of the given type.
    pub async fn msg_expect(&mut self, kind: MsgType) -> Result<String> {
        let (got, body) = self.msg_read().await?;
        if got != kind {
            return Err(Error::WsProto);
        }
        Ok(body)
    }

    /// Read one message that must be of the given type with an empty body.
    pub async fn msg_expect_empty(&mut self, kind: MsgType) -> Result<()> {
        if self.msg_expect(kind).await?.is_empty() {
            Ok(())
        } else {
            Err(Error::WsProto)
        }
    }

    /// Read a TEST_PREPARE carrying `"<port> [nflows]"`.
    ///
    /// `nflows` defaults to 1 and is capped at 16, as the reference server
    /// never asks for more.
    pub async fn msg_expect_test_prepare(&mut self) -> Result<(String, u8)> {
        let body = self.msg_expect(MsgType::TestPrepare).await?;
        let mut fields = body.split_ascii_whitespace();
        let port = fields.next().ok_or(Error::WsProto)?;
        let port: u16 = port.parse().map_err(|_| Error::WsProto)?;
        if port == 0 {
            return Err(Error::WsProto);
        }
        let nflows = match fields.next() {
            Some(token) => token.parse::<u8>().map_err(|_| Error::WsProto)?,
            None => 1,
        };
        if nflows == 0 || nflows > 16 {
            return Err(Error::WsProto);
        }
        Ok((port.to_string(), nflows))
    }
}
