//! SOCKS5h tunnel negotiation (RFC 1928, no authentication).
//!
//! The destination hostname travels to the proxy verbatim (ATYP=domain);
//! it is never resolved locally, which is what the trailing "h" means.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::net::Conn;

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const ATYP_IPV6: u8 = 4;

/// Negotiate a CONNECT tunnel to `hostname:port` on an open proxy
/// connection. On success the stream carries end-to-end traffic.
pub async fn connect<S>(conn: &mut Conn<S>, hostname: &str, port: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let port: u16 = port.parse().map_err(|_| Error::InvalidArgument)?;
    if hostname.is_empty() || hostname.len() > 255 {
        return Err(Error::InvalidArgument);
    }

    // Method selection: we only ever offer "no authentication".
    conn.sendn(&[VERSION, 1, METHOD_NO_AUTH]).await?;
    let mut chosen = [0u8; 2];
    conn.recvn(&mut chosen).await?;
    if chosen != [VERSION, METHOD_NO_AUTH] {
        return Err(Error::Socks5h);
    }

    let mut request = Vec::with_capacity(7 + hostname.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, 0, ATYP_DOMAIN, hostname.len() as u8]);
    request.extend_from_slice(hostname.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    conn.sendn(&request).await?;

    let mut reply = [0u8; 4];
    conn.recvn(&mut reply).await?;
    if reply[0] != VERSION || reply[1] != 0 {
        return Err(Error::Socks5h);
    }
    // Consume the bound address the proxy reports; its value is unused.
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            conn.recvn(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(Error::Socks5h),
    };
    let mut bound = vec![0u8; bound_len + 2];
    conn.recvn(&mut bound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    async fn proxy_script(mut peer: DuplexStream, reply_code: u8) -> Vec<u8> {
        let mut greeting = [0u8; 3];
        peer.read_exact(&mut greeting).await.unwrap();
        peer.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 5];
        peer.read_exact(&mut head).await.unwrap();
        let mut rest = vec![0u8; head[4] as usize + 2];
        peer.read_exact(&mut rest).await.unwrap();

        // Reply with an IPv4 bound address.
        peer.write_all(&[5, reply_code, 0, 1, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut request = head.to_vec();
        request.extend_from_slice(&rest);
        request
    }

    #[tokio::test]
    async fn connect_round_trips_through_a_mock_proxy() {
        let (client, server) = tokio::io::duplex(256);
        let mut conn = Conn::new(client, Duration::from_secs(1));

        let proxy = tokio::spawn(proxy_script(server, 0));
        connect(&mut conn, "ndt.example.org", "3001").await.unwrap();

        let request = proxy.await.unwrap();
        assert_eq!(&request[..4], &[5, 1, 0, 3]);
        assert_eq!(request[4] as usize, "ndt.example.org".len());
        assert_eq!(&request[5..20], b"ndt.example.org");
        assert_eq!(&request[20..], &3001u16.to_be_bytes());
    }

    #[tokio::test]
    async fn nonzero_reply_fails() {
        let (client, server) = tokio::io::duplex(256);
        let mut conn = Conn::new(client, Duration::from_secs(1));

        let proxy = tokio::spawn(proxy_script(server, 5));
        let err = connect(&mut conn, "ndt.example.org", "3001")
            .await
            .unwrap_err();
        assert_eq!(err, Error::Socks5h);
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn bad_method_selection_fails() {
        let (client, mut server) = tokio::io::duplex(256);
        let mut conn = Conn::new(client, Duration::from_secs(1));

        // Proxy demands username/password authentication.
        server.write_all(&[5, 2]).await.unwrap();
        let err = connect(&mut conn, "ndt.example.org", "3001")
            .await
            .unwrap_err();
        assert_eq!(err, Error::Socks5h);
    }
}
