//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which is a [`tower::Service`] that connects to
//! resolved addresses using TCP. It also contains the [`TcpTransportConfig`] type, which is used to
//! configure socket options on new connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpSocket;
use tracing::{Instrument, trace, warn};

use crate::client::conn::dns::SocketAddrs;
use crate::client::error::ConnectionError;
use crate::stream::tcp::TcpStream;

/// Socket buffer size applied to new connections by default.
pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// A TCP connector for client connections.
///
/// Addresses are tried in the order the resolver returned them; the first successful
/// connection wins, and if all fail the last error is reported.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: Arc<TcpTransportConfig>) -> Self {
        Self { config }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

impl tower::Service<SocketAddrs> for TcpTransport {
    type Response = TcpStream;
    type Error = ConnectionError;
    type Future = crate::BoxFuture<'static, Result<TcpStream, ConnectionError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut addrs: SocketAddrs) -> Self::Future {
        let config = self.config.clone();
        let span = tracing::trace_span!("tcp");

        Box::pin(
            async move {
                let mut last_error = None;
                while let Some(address) = addrs.pop() {
                    let span = tracing::trace_span!("connect", %address);
                    match connect(address, &config).instrument(span).await {
                        Ok(stream) => {
                            trace!(peer.addr = %address, "tcp connected");
                            return Ok(stream);
                        }
                        Err(error) => {
                            trace!(%address, %error, "tcp connect attempt failed");
                            last_error = Some(error);
                        }
                    }
                }

                Err(last_error.unwrap_or_else(|| ConnectionError::NoAddresses {
                    host: String::new(),
                }))
            }
            .instrument(span),
        )
    }
}

/// Make a single connection attempt.
async fn connect(addr: SocketAddr, config: &TcpTransportConfig) -> Result<TcpStream, ConnectionError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|source| ConnectionError::Connect { addr, source })?;

    if config.keepalive {
        if let Err(e) = socket.set_keepalive(true) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_send_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    let connect = socket.connect(addr);
    let stream = match config.connect_timeout {
        Some(after) => match tokio::time::timeout(after, connect).await {
            Ok(outcome) => outcome,
            Err(_) => {
                trace!(timeout = ?after, "connection timed out");
                return Err(ConnectionError::ConnectTimeout { addr, after });
            }
        },
        None => connect.await,
    }
    .map_err(|source| ConnectionError::Connect { addr, source })?;

    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    Ok(TcpStream::client(stream, addr))
}

/// Configuration for TCP connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct TcpTransportConfig {
    /// The timeout for each connection attempt.
    #[serde(deserialize_with = "crate::client::config::secs::option")]
    pub connect_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to enable `SO_KEEPALIVE`.
    pub keepalive: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            nodelay: true,
            keepalive: true,
            send_buffer_size: Some(DEFAULT_SOCKET_BUFFER_SIZE),
            recv_buffer_size: Some(DEFAULT_SOCKET_BUFFER_SIZE),
        }
    }
}
