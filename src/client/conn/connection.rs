//! A single HTTP/1.1 connection to a destination.
//!
//! A connection carries one request at a time. After each exchange it records whether the
//! server allowed the connection to be kept alive; the pool uses [`Connection::is_reusable`]
//! and [`Connection::probe`] to decide whether it may be handed out again.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use http::Version;
use tokio_util::codec::Framed;
use tracing::trace;

use crate::client::body::Body;
use crate::client::codec::{Http1Codec, Outgoing, RequestHead, ResponseParts};
use crate::client::error::{ConnectionError, Error};
use crate::client::pool::DestinationKey;
use crate::info::{ConnectionInfo, HasConnectionInfo};
use crate::stream::Stream;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Parked in the pool.
    Idle,
    /// Checked out by a request.
    InUse,
    /// Will not be reused; closed when released.
    Closing,
    /// The socket has been shut.
    Closed,
}

/// An HTTP/1.1 connection.
pub struct Connection {
    id: ConnectionId,
    key: DestinationKey,
    framed: Framed<Stream, Http1Codec>,
    info: ConnectionInfo<SocketAddr>,
    state: ConnectionState,
    created: Instant,
    last_used: Instant,
    requests: usize,
    keep_alive: bool,
    version: Version,
    in_flight: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .finish()
    }
}

impl Connection {
    /// Wrap a connected stream.
    pub fn new(key: DestinationKey, stream: Stream, max_header_size: usize) -> Self {
        let info = stream.info();
        let now = Instant::now();
        let id = ConnectionId::next();
        trace!(%id, %key, remote = %info.remote_addr(), "new connection");

        Self {
            id,
            key,
            framed: Framed::new(stream, Http1Codec::new(max_header_size)),
            info,
            state: ConnectionState::InUse,
            created: now,
            last_used: now,
            requests: 0,
            keep_alive: true,
            version: Version::HTTP_11,
            in_flight: false,
        }
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The destination this connection is bound to.
    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    /// Local and remote socket addresses.
    pub fn info(&self) -> &ConnectionInfo<SocketAddr> {
        &self.info
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    /// Number of requests sent on this connection.
    pub fn requests(&self) -> usize {
        self.requests
    }

    /// HTTP version of the last response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// How long ago the connection was opened.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Whether the connection has been unused for at least `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_used.elapsed() >= timeout
    }

    /// Whether the last exchange completed and left the connection fit to carry another request.
    pub fn is_reusable(&self) -> bool {
        matches!(self.state, ConnectionState::InUse | ConnectionState::Idle)
            && self.keep_alive
            && !self.in_flight
            && self.framed.read_buffer().is_empty()
    }

    /// Check, without waiting, that an idle connection has not been closed or sent
    /// unsolicited data by the peer.
    pub fn probe(&mut self) -> bool {
        if !self.framed.read_buffer().is_empty() {
            trace!(id = %self.id, "unread data on idle connection");
            return false;
        }

        match self.framed.next().now_or_never() {
            None => true,
            Some(None) => {
                trace!(id = %self.id, "idle connection closed by peer");
                false
            }
            Some(Some(_)) => {
                trace!(id = %self.id, "unexpected data on idle connection");
                false
            }
        }
    }

    /// Mark the connection as not reusable.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closing;
        }
    }

    /// Send one request and read its response.
    ///
    /// Any failure leaves the connection in [`ConnectionState::Closing`].
    pub async fn send_request(&mut self, head: RequestHead, body: Body) -> Result<ResponseParts, Error> {
        self.in_flight = true;
        self.requests += 1;
        self.last_used = Instant::now();

        match self.exchange(head, body).await {
            Ok(parts) => {
                self.in_flight = false;
                self.last_used = Instant::now();
                self.keep_alive = parts.keep_alive;
                self.version = parts.version;
                if !self.keep_alive {
                    trace!(id = %self.id, "server asked to close the connection");
                    self.state = ConnectionState::Closing;
                }
                Ok(parts)
            }
            Err(error) => {
                trace!(id = %self.id, %error, "exchange failed");
                self.state = ConnectionState::Closing;
                Err(error)
            }
        }
    }

    async fn exchange(&mut self, head: RequestHead, body: Body) -> Result<ResponseParts, Error> {
        match body {
            Body::Empty => self.framed.send(Outgoing::Full(head, Bytes::new())).await?,
            Body::Full(bytes) => self.framed.send(Outgoing::Full(head, bytes)).await?,
            Body::Stream(mut stream) => {
                self.framed.feed(Outgoing::StreamHead(head)).await?;
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(ConnectionError::Io)?;
                    self.framed.feed(Outgoing::Chunk(chunk)).await?;
                }
                self.framed.send(Outgoing::EndStream).await?;
            }
        }

        match self.framed.next().await {
            Some(parts) => Ok(parts?),
            None => Err(ConnectionError::Closed.into()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            trace!(id = %self.id, requests = self.requests, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    use crate::client::pool::Scheme;
    use crate::stream::tcp::TcpStream;

    assert_impl_all!(Connection: Send);

    async fn pair() -> (Connection, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        let key = DestinationKey::new(Scheme::Http, "127.0.0.1", addr.port());
        let stream = Stream::from(TcpStream::client(client.unwrap(), addr));
        (Connection::new(key, stream, 1024), server.unwrap().0)
    }

    async fn read_head(server: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        while !buf.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            server.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn keep_alive_exchange() {
        crate::fixtures::subscribe();
        let (mut conn, mut server) = pair().await;

        let serve = async {
            let head = read_head(&mut server).await;
            assert!(head.starts_with("GET /a HTTP/1.1\r\n"));
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
        };

        let (parts, ()) = tokio::join!(
            conn.send_request(RequestHead::new(http::Method::GET, "/a"), Body::Empty),
            serve
        );
        let parts = parts.unwrap();
        assert_eq!(parts.body, "ok");
        assert!(conn.is_reusable());
        assert!(conn.probe());
        assert_eq!(conn.requests(), 1);
    }

    #[tokio::test]
    async fn connection_close_is_not_reusable() {
        let (mut conn, mut server) = pair().await;

        let serve = async {
            read_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        };

        let (parts, ()) = tokio::join!(
            conn.send_request(RequestHead::new(http::Method::GET, "/"), Body::Empty),
            serve
        );
        assert!(!parts.unwrap().keep_alive);
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn peer_close_before_response() {
        let (mut conn, mut server) = pair().await;

        let serve = async move {
            read_head(&mut server).await;
            drop(server);
        };

        let (result, ()) = tokio::join!(
            conn.send_request(RequestHead::new(http::Method::GET, "/"), Body::Empty),
            serve
        );
        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Closed))
        ));
        assert!(!conn.is_reusable());
    }

    #[tokio::test]
    async fn probe_detects_closed_peer() {
        let (mut conn, server) = pair().await;
        drop(server);

        // Give the FIN time to arrive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.probe());
    }

    #[tokio::test]
    async fn streaming_body_is_chunked() {
        let (mut conn, mut server) = pair().await;

        let serve = async {
            let head = read_head(&mut server).await;
            assert!(head.to_ascii_lowercase().contains("transfer-encoding: chunked"));
            let mut body = Vec::new();
            while !body.ends_with(b"0\r\n\r\n") {
                let mut byte = [0u8; 1];
                server.read_exact(&mut byte).await.unwrap();
                body.push(byte[0]);
            }
            assert_eq!(body, b"2\r\nab\r\n1\r\nc\r\n0\r\n\r\n");
            server
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
        };

        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"c")),
        ]);
        let (parts, ()) = tokio::join!(
            conn.send_request(
                RequestHead::new(http::Method::POST, "/upload"),
                Body::stream(chunks)
            ),
            serve
        );
        assert_eq!(parts.unwrap().status, http::StatusCode::NO_CONTENT);
    }
}
