//! Blocking-semantics I/O over non-blocking sockets.
//!
//! Every socket the client opens is a non-blocking tokio socket; reads and
//! writes suspend only at readiness and each operation is bounded by the
//! per-operation deadline carried in [`Conn`]. Callers never observe a
//! would-block or partial `recvn`/`sendn` result.
//!
//! The layered dial lives here too: TCP, then optionally a SOCKS5h tunnel,
//! then optionally TLS, then optionally the WebSocket upgrade. Each layer is
//! transparent to the NDT framing above it.

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::settings::{ProtocolFlags, Settings};
use crate::{socks5, tls, ws};

/// A control or measurement transport: plain TCP, or TLS over TCP.
pub enum Stream {
    /// An in-clear TCP connection.
    Tcp(TcpStream),
    /// A TLS session over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Resolve `hostname:port` into one or more socket addresses.
pub async fn resolve(hostname: &str, port: &str, deadline: Duration) -> Result<Vec<SocketAddr>> {
    let query = format!("{hostname}:{port}");
    let addrs = timeout(deadline, lookup_host(query))
        .await
        .map_err(|_| Error::TimedOut)?
        .map_err(|_| Error::AiGeneric)?;
    let addrs: Vec<SocketAddr> = addrs.collect();
    if addrs.is_empty() {
        return Err(Error::AiNoname);
    }
    Ok(addrs)
}

/// Connect a TCP socket, trying each resolved address in turn.
pub async fn dial(hostname: &str, port: &str, deadline: Duration) -> Result<TcpStream> {
    let addrs = resolve(hostname, port, deadline).await?;
    let mut last = Error::IoError;
    for addr in addrs {
        match timeout(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => last = Error::from_io(&err),
            Err(_) => last = Error::TimedOut,
        }
    }
    Err(last)
}

/// Synchronous-feeling I/O over a non-blocking stream.
///
/// Every operation fails with [`Error::TimedOut`] once the per-operation
/// deadline expires.
pub struct Conn<S> {
    stream: S,
    deadline: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Conn<S> {
    /// Wrap `stream` with a per-operation deadline.
    pub fn new(stream: S, deadline: Duration) -> Self {
        Conn { stream, deadline }
    }

    /// The current per-operation deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Replace the per-operation deadline.
    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = deadline;
    }

    /// Unwrap the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Receive at most `buf.len()` bytes; zero means the peer closed.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match timeout(self.deadline, self.stream.read(buf)).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(err)) => Err(Error::from_io(&err)),
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Receive exactly `buf.len()` bytes, or fail.
    ///
    /// An early close is [`Error::Eof`]; there is no partial success.
    pub async fn recvn(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            match self.recv(&mut buf[off..]).await? {
                0 => return Err(Error::Eof),
                count => off += count,
            }
        }
        Ok(())
    }

    /// Send at most `buf.len()` bytes, returning how many went out.
    pub async fn send(&mut self, buf: &[u8]) -> Result<usize> {
        match timeout(self.deadline, self.stream.write(buf)).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(err)) => Err(Error::from_io(&err)),
            Err(_) => Err(Error::TimedOut),
        }
    }

    /// Send all of `buf`, or fail.
    pub async fn sendn(&mut self, buf: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < buf.len() {
            match self.send(&buf[off..]).await? {
                0 => return Err(Error::IoError),
                count => off += count,
            }
        }
        Ok(())
    }

    /// Half-close the write side (TCP FIN, or TLS close_notify).
    pub async fn shutdown(&mut self) -> Result<()> {
        match timeout(self.deadline, self.stream.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Error::from_io(&err)),
            Err(_) => Err(Error::TimedOut),
        }
    }
}

/// Dial the full transport stack towards `hostname:port`.
///
/// The SOCKS5h tunnel, the TLS session and the WebSocket upgrade are each
/// negotiated only when the corresponding setting asks for them. `ws_flags`
/// and `ws_protocol` configure the upgrade as described in [`crate::ws`].
pub async fn dial_stack(
    settings: &Settings,
    hostname: &str,
    port: &str,
    ws_flags: u8,
    ws_protocol: &str,
) -> Result<Conn<Stream>> {
    let tcp = if settings.socks5h_port.is_empty() {
        dial(hostname, port, settings.timeout).await?
    } else {
        let proxy = dial("127.0.0.1", &settings.socks5h_port, settings.timeout).await?;
        let mut proxy = Conn::new(proxy, settings.timeout);
        socks5::connect(&mut proxy, hostname, port).await?;
        proxy.into_inner()
    };

    let stream = if settings.protocol_flags.contains(ProtocolFlags::TLS) {
        // SNI and verification use the hostname the caller asked for, not
        // any SOCKS-intermediate name.
        Stream::Tls(Box::new(tls::handshake(settings, hostname, tcp).await?))
    } else {
        Stream::Tcp(tcp)
    };

    let mut conn = Conn::new(stream, settings.timeout);
    if settings.protocol_flags.contains(ProtocolFlags::WEBSOCKET) {
        ws::handshake(&mut conn, hostname, port, ws_flags, ws_protocol).await?;
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recvn_is_exact_or_error() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = Conn::new(client, Duration::from_secs(1));

        tokio::io::AsyncWriteExt::write_all(&mut server, b"hello world")
            .await
            .unwrap();

        let mut buf = [0u8; 5];
        conn.recvn(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Peer closes with fewer bytes pending than requested.
        drop(server);
        let mut buf = [0u8; 32];
        assert_eq!(conn.recvn(&mut buf).await, Err(Error::Eof));
    }

    #[tokio::test(start_paused = true)]
    async fn recv_times_out_when_the_peer_stalls() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = Conn::new(client, Duration::from_secs(2));

        let before = tokio::time::Instant::now();
        let mut buf = [0u8; 1];
        assert_eq!(conn.recv(&mut buf).await, Err(Error::TimedOut));
        assert_eq!(before.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn dial_reaches_a_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let dialed = dial("127.0.0.1", &port, Duration::from_secs(2));
        let (accepted, _) = tokio::join!(listener.accept(), dialed);
        accepted.unwrap();
    }

    #[tokio::test]
    async fn dial_refused_maps_to_the_taxonomy() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        drop(listener);

        let err = dial("127.0.0.1", &port, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, Error::ConnectionRefused);
    }
}
