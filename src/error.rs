//! The closed error taxonomy shared by every layer.
//!
//! System errors enter the taxonomy exactly once, at the socket wrappers in
//! [`crate::net`]; higher layers may replace a low-level error with a more
//! specific one but never invent new kinds.

use thiserror::Error;

/// Everything that can go wrong during an NDT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The local end of the connection has been closed for writing.
    #[error("broken pipe")]
    BrokenPipe,
    /// The connection was aborted by the network stack.
    #[error("connection aborted")]
    ConnectionAborted,
    /// The remote host refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The connection was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// The operation is not supported on this platform.
    #[error("function not supported")]
    FunctionNotSupported,
    /// No route to the remote host.
    #[error("host unreachable")]
    HostUnreachable,
    /// The operation was interrupted before completion.
    #[error("interrupted")]
    Interrupted,
    /// An argument was rejected before any I/O took place.
    #[error("invalid argument")]
    InvalidArgument,
    /// A system-level I/O failure with no more specific mapping.
    #[error("i/o error")]
    IoError,
    /// A message does not fit the wire format's size limits.
    #[error("message too large")]
    MessageSize,
    /// The local network interface is down.
    #[error("network down")]
    NetworkDown,
    /// The connection was dropped because the network reset it.
    #[error("network reset")]
    NetworkReset,
    /// The remote network is unreachable.
    #[error("network unreachable")]
    NetworkUnreachable,
    /// A connect is still in progress.
    #[error("operation in progress")]
    OperationInProgress,
    /// The socket is not ready; retried internally, never surfaced to users.
    #[error("operation would block")]
    OperationWouldBlock,
    /// The per-operation deadline expired.
    #[error("timed out")]
    TimedOut,
    /// A value did not fit the destination field.
    #[error("value too large")]
    ValueTooLarge,
    /// The resolver failed in an unspecified way.
    #[error("resolver failure")]
    AiGeneric,
    /// The resolver failed temporarily.
    #[error("temporary resolver failure")]
    AiAgain,
    /// The resolver failed permanently.
    #[error("non-recoverable resolver failure")]
    AiFail,
    /// The hostname does not resolve to any address.
    #[error("hostname not found")]
    AiNoname,
    /// The TLS layer failed in an unspecified way.
    #[error("TLS failure")]
    SslGeneric,
    /// The TLS layer needs more bytes from the network.
    #[error("TLS wants a read")]
    SslWantRead,
    /// The TLS layer needs to flush bytes to the network.
    #[error("TLS wants a write")]
    SslWantWrite,
    /// An I/O failure occurred underneath the TLS layer.
    #[error("TLS syscall failure")]
    SslSyscall,
    /// The peer closed the connection mid-exchange.
    #[error("unexpected end of stream")]
    Eof,
    /// The SOCKS5h proxy rejected or garbled the tunnel negotiation.
    #[error("SOCKS5h negotiation failed")]
    Socks5h,
    /// The peer violated the NDT or WebSocket protocol.
    #[error("protocol violation")]
    WsProto,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map an OS-level I/O error into the taxonomy.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::BrokenPipe => Error::BrokenPipe,
            ErrorKind::ConnectionAborted => Error::ConnectionAborted,
            ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            ErrorKind::ConnectionReset => Error::ConnectionReset,
            ErrorKind::Unsupported => Error::FunctionNotSupported,
            ErrorKind::HostUnreachable => Error::HostUnreachable,
            ErrorKind::Interrupted => Error::Interrupted,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Error::InvalidArgument,
            ErrorKind::NetworkDown => Error::NetworkDown,
            ErrorKind::NetworkUnreachable => Error::NetworkUnreachable,
            ErrorKind::WouldBlock => Error::OperationWouldBlock,
            ErrorKind::TimedOut => Error::TimedOut,
            ErrorKind::UnexpectedEof => Error::Eof,
            _ => Error::IoError,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_into_the_taxonomy() {
        use std::io::ErrorKind;
        let cases = [
            (ErrorKind::BrokenPipe, Error::BrokenPipe),
            (ErrorKind::ConnectionRefused, Error::ConnectionRefused),
            (ErrorKind::ConnectionReset, Error::ConnectionReset),
            (ErrorKind::TimedOut, Error::TimedOut),
            (ErrorKind::WouldBlock, Error::OperationWouldBlock),
            (ErrorKind::UnexpectedEof, Error::Eof),
            (ErrorKind::Other, Error::IoError),
        ];
        for (kind, expected) in cases {
            let err = std::io::Error::from(kind);
            assert_eq!(Error::from_io(&err), expected);
        }
    }
}
