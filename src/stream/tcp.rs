//! TCP stream which remembers its peer.
//!
//! Some platforms stop reporting `peer_addr` once the peer has gone away. The address the
//! transport connected to is kept alongside the socket so connection info stays available
//! for logging for the lifetime of the stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::info::{ConnectionInfo, HasConnectionInfo};

/// Canonicalize a socket address, converting IPv4-mapped IPv6 addresses
/// into standard IPv4 addresses.
pub(crate) fn make_canonical(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        std::net::IpAddr::V4(_) => addr,
        std::net::IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(ip) => SocketAddr::new(std::net::IpAddr::V4(ip), addr.port()),
            None => addr,
        },
    }
}

/// A client TCP stream, wrapping `tokio::net::TcpStream`.
#[pin_project::pin_project]
pub struct TcpStream {
    #[pin]
    stream: tokio::net::TcpStream,
    remote: SocketAddr,
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.stream.fmt(f)
    }
}

impl TcpStream {
    /// Wrap a stream connected to `remote`.
    pub fn client(stream: tokio::net::TcpStream, remote: SocketAddr) -> Self {
        Self {
            stream,
            remote: make_canonical(remote),
        }
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Local address of the connection. See `tokio::net::TcpStream::local_addr`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr().map(make_canonical)
    }

    /// The underlying tokio stream.
    pub fn get_ref(&self) -> &tokio::net::TcpStream {
        &self.stream
    }
}

impl HasConnectionInfo for TcpStream {
    type Addr = SocketAddr;

    fn info(&self) -> ConnectionInfo<Self::Addr> {
        let local_addr = self
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        ConnectionInfo {
            local_addr,
            remote_addr: self.remote,
        }
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn canonical_addresses() {
        let mapped = SocketAddr::new(Ipv4Addr::new(192, 0, 2, 1).to_ipv6_mapped().into(), 80);
        assert_eq!(
            make_canonical(mapped),
            SocketAddr::from(([192, 0, 2, 1], 80))
        );

        let v6 = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 80);
        assert_eq!(make_canonical(v6), v6);
    }

    #[tokio::test]
    async fn info_reports_both_ends() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());

        let stream = TcpStream::client(stream.unwrap(), addr);
        let info = stream.info();
        assert_eq!(*info.remote_addr(), addr);
        assert_eq!(info.local_addr().ip(), Ipv4Addr::LOCALHOST);
    }
}
