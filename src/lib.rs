//! # Carafe: a connection-pooled HTTP/1.1 client
//!
//! Carafe sends HTTP/1.1 requests over plain TCP or TLS, keeping connections open between
//! requests and sharing them between concurrent callers. Its API follows the shape of the
//! popular "requests" style of client: a [`Session`] with default headers, credentials and
//! cookies, per-call [`RequestOptions`], and fully buffered [`Response`]s.
//!
//! ## Architecture Overview
//!
//! A request travels through these layers:
//!
//! 1. **Session** merges its defaults into the request (per-call values win).
//! 2. **Executor** checks a connection out of the pool, runs one exchange, returns the
//!    connection and follows redirects.
//! 3. **Pool** keeps, per destination (scheme, host and port), a most-recently-used stack of
//!    idle connections and a count of open ones. Below the per-destination limit a new
//!    connection is opened; at the limit callers wait in arrival order.
//! 4. **Connector** resolves the host, connects over TCP and runs the TLS handshake.
//! 5. **Codec** writes the request and parses the response incrementally, whatever way the
//!    bytes arrive.
//!
//! The batch helpers ([`Session::bulk_get`], [`Session::bulk`]) run many requests at once,
//! bounded by the pool limit, and return results in input order.
//!
//! ## Example
//!
//! ```no_run
//! use carafe::{RequestOptions, Session};
//!
//! # async fn run() -> Result<(), carafe::Error> {
//! let session = Session::new();
//! let response = session
//!     .get("http://example.com/", RequestOptions::new().param("q", "pool"))
//!     .await?
//!     .error_for_status()?;
//! println!("{}", response.text());
//! session.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `tls`: Enables https support using rustls
//! - `tls-ring`: Use ring as the crypto backend for TLS
//! - `tls-aws-lc`: Use AWS-LC as the crypto backend for TLS

use std::{fmt, pin::Pin};

pub mod client;
pub mod info;
mod notify;
pub mod stream;

pub use self::client::{
    Auth, Body, Error, PoolConfig, Request, RequestOptions, Response, Session, SessionBuilder,
    SessionConfig,
};

#[cfg(all(
    feature = "tls",
    not(any(feature = "tls-ring", feature = "tls-aws-lc"))
))]
compile_error!(
    "The 'tls' feature requires a backend, enable 'tls-ring' or 'tls-aws-lc' to select a backend"
);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Send one request on a short-lived session, closed before returning.
pub async fn request(
    method: http::Method,
    url: &str,
    options: RequestOptions,
) -> Result<Response, Error> {
    let session = Session::new();
    let result = session.request(method, url, options).await;
    session.close();
    result
}

macro_rules! one_off {
    ($(#[$doc:meta])* $name:ident, $method:expr) => {
        $(#[$doc])*
        pub async fn $name(url: &str, options: RequestOptions) -> Result<Response, Error> {
            request($method, url, options).await
        }
    };
}

one_off!(
    /// Send one GET request on a short-lived session.
    get,
    http::Method::GET
);
one_off!(
    /// Send one POST request on a short-lived session.
    post,
    http::Method::POST
);
one_off!(
    /// Send one PUT request on a short-lived session.
    put,
    http::Method::PUT
);
one_off!(
    /// Send one DELETE request on a short-lived session.
    delete,
    http::Method::DELETE
);
one_off!(
    /// Send one PATCH request on a short-lived session.
    patch,
    http::Method::PATCH
);
one_off!(
    /// Send one HEAD request on a short-lived session.
    head,
    http::Method::HEAD
);
one_off!(
    /// Send one OPTIONS request on a short-lived session.
    options,
    http::Method::OPTIONS
);

/// Test fixtures
#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod fixtures {

    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::Once;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Registers a global default tracing subscriber when called for the first time. This is intended
    /// for use in tests. A subscriber installed elsewhere is left in place.
    pub fn subscribe() {
        static INSTALL_TRACING_SUBSCRIBER: Once = Once::new();
        INSTALL_TRACING_SUBSCRIBER.call_once(|| {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        });
    }

    /// A request as seen by [`TestServer`].
    #[derive(Debug, Clone)]
    pub(crate) struct RecordedRequest {
        pub(crate) method: String,
        pub(crate) target: String,
        pub(crate) headers: Vec<(String, String)>,
        pub(crate) body: Vec<u8>,
    }

    impl RecordedRequest {
        pub(crate) fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub(crate) fn header_all(&self, name: &str) -> Vec<&str> {
            self.headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
                .collect()
        }
    }

    /// Parse one request from the front of `buf`, returning it with the number of bytes it
    /// occupied. `None` means more bytes are needed.
    pub(crate) fn parse_request(buf: &[u8]) -> Option<(RecordedRequest, usize)> {
        let end = buf.windows(4).position(|w| w == b"\r\n\r\n")?;
        let head = std::str::from_utf8(&buf[..end]).ok()?;
        let mut lines = head.split("\r\n");

        let mut request_line = lines.next()?.split(' ');
        let method = request_line.next()?.to_owned();
        let target = request_line.next()?.to_owned();

        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
            .collect();

        let mut request = RecordedRequest {
            method,
            target,
            headers,
            body: Vec::new(),
        };

        let mut at = end + 4;
        let chunked = request
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        if chunked {
            loop {
                let line_end = at + buf[at..].windows(2).position(|w| w == b"\r\n")?;
                let size = std::str::from_utf8(&buf[at..line_end]).ok()?;
                let size = usize::from_str_radix(size.split(';').next()?.trim(), 16).ok()?;
                at = line_end + 2;
                if size == 0 {
                    let trailer_end = buf[at..].windows(2).position(|w| w == b"\r\n")?;
                    at += trailer_end + 2;
                    break;
                }
                if buf.len() < at + size + 2 {
                    return None;
                }
                request.body.extend_from_slice(&buf[at..at + size]);
                at += size + 2;
            }
        } else {
            let length: usize = request
                .header("content-length")
                .map_or(Some(0), |v| v.parse().ok())?;
            if buf.len() < at + length {
                return None;
            }
            request.body.extend_from_slice(&buf[at..at + length]);
            at += length;
        }

        Some((request, at))
    }

    /// A scripted response.
    #[derive(Debug, Clone)]
    pub(crate) struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        raw: Option<Bytes>,
        close: bool,
        delay: Option<Duration>,
    }

    impl Reply {
        pub(crate) fn status(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: Bytes::new(),
                raw: None,
                close: false,
                delay: None,
            }
        }

        pub(crate) fn ok(body: impl Into<Bytes>) -> Self {
            Self {
                body: body.into(),
                ..Self::status(200)
            }
        }

        pub(crate) fn json(body: &str) -> Self {
            Self::ok(body.to_owned()).header("content-type", "application/json")
        }

        pub(crate) fn redirect(status: u16, location: &str) -> Self {
            Self::status(status).header("location", location)
        }

        /// Bytes written as they are, with no framing added.
        pub(crate) fn raw(bytes: impl Into<Bytes>) -> Self {
            Self {
                raw: Some(bytes.into()),
                ..Self::status(200)
            }
        }

        pub(crate) fn header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_owned(), value.to_owned()));
            self
        }

        /// Close the connection after this response.
        pub(crate) fn close(mut self) -> Self {
            self.close = true;
            self.header("connection", "close")
        }

        pub(crate) fn delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn encode(&self) -> Vec<u8> {
            if let Some(raw) = &self.raw {
                return raw.to_vec();
            }

            let reason = http::StatusCode::from_u16(self.status)
                .ok()
                .and_then(|status| status.canonical_reason())
                .unwrap_or("Unknown");
            let mut out = format!("HTTP/1.1 {} {reason}\r\n", self.status);
            for (name, value) in &self.headers {
                out.push_str(&format!("{name}: {value}\r\n"));
            }
            let framed = self.headers.iter().any(|(name, _)| {
                name.eq_ignore_ascii_case("content-length")
                    || name.eq_ignore_ascii_case("transfer-encoding")
            });
            if !framed {
                out.push_str(&format!("content-length: {}\r\n", self.body.len()));
            }
            out.push_str("\r\n");

            let mut out = out.into_bytes();
            out.extend_from_slice(&self.body);
            out
        }
    }

    type Handler = Arc<dyn Fn(&RecordedRequest) -> Reply + Send + Sync>;

    /// A keep-alive HTTP/1.1 server on `127.0.0.1` answering with scripted replies.
    #[derive(Debug)]
    pub(crate) struct TestServer {
        addr: SocketAddr,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
        connections: Arc<AtomicUsize>,
        task: JoinHandle<()>,
    }

    impl TestServer {
        pub(crate) async fn start<F>(handler: F) -> Self
        where
            F: Fn(&RecordedRequest) -> Reply + Send + Sync + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let handler: Handler = Arc::new(handler);
            let requests = Arc::new(Mutex::new(Vec::new()));
            let connections = Arc::new(AtomicUsize::new(0));

            let task = tokio::spawn({
                let requests = requests.clone();
                let connections = connections.clone();
                async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve(stream, handler.clone(), requests.clone()));
                    }
                }
            });

            Self {
                addr,
                requests,
                connections,
                task,
            }
        }

        pub(crate) fn addr(&self) -> SocketAddr {
            self.addr
        }

        pub(crate) fn url(&self, path: &str) -> String {
            format!("http://{}{path}", self.addr)
        }

        /// Requests received so far, in arrival order.
        pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().clone()
        }

        /// Connections accepted so far.
        pub(crate) fn connections(&self) -> usize {
            self.connections.load(Ordering::SeqCst)
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    async fn serve(
        mut stream: TcpStream,
        handler: Handler,
        requests: Arc<Mutex<Vec<RecordedRequest>>>,
    ) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let (request, consumed) = loop {
                if let Some(parsed) = parse_request(&buf) {
                    break parsed;
                }
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            buf.drain(..consumed);

            let reply = handler(&request);
            let client_close = request
                .header("connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("close"));
            requests.lock().push(request);

            if let Some(delay) = reply.delay {
                tokio::time::sleep(delay).await;
            }
            if stream.write_all(&reply.encode()).await.is_err() {
                return;
            }
            if reply.close || client_close {
                let _ = stream.shutdown().await;
                return;
            }
        }
    }
}
