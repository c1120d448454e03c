//! Errors returned by the client.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use super::codec::CodecError;
pub use super::codec::ProtocolError;
pub use super::conn::transport::TlsConnectionError;
use super::response::Response;

/// Failure to establish or use a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Name resolution failed.
    #[error("failed to resolve {host}")]
    Resolve {
        /// The host being resolved.
        host: String,
        /// The resolver's error.
        #[source]
        source: io::Error,
    },

    /// Name resolution succeeded but returned nothing.
    #[error("no addresses found for {host}")]
    NoAddresses {
        /// The host being resolved.
        host: String,
    },

    /// Every connection attempt failed; this is the last failure.
    #[error("failed to connect to {addr}")]
    Connect {
        /// The address of the last attempt.
        addr: SocketAddr,
        /// The socket error.
        #[source]
        source: io::Error,
    },

    /// The last connection attempt did not complete in time.
    #[error("connecting to {addr} timed out after {after:?}")]
    ConnectTimeout {
        /// The address of the last attempt.
        addr: SocketAddr,
        /// The configured connect timeout.
        after: Duration,
    },

    /// Establishing the secure channel failed.
    #[error(transparent)]
    Tls(#[from] TlsConnectionError),

    /// The peer closed the connection before sending a response.
    #[error("connection closed by peer")]
    Closed,

    /// Reading from or writing to the socket failed.
    #[error("connection i/o error")]
    Io(#[from] io::Error),
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Opening the socket.
    Connect,
    /// Waiting for a pooled connection to become available.
    Acquire,
    /// The request as a whole, including connect, write and read.
    Request,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => f.write_str("connect"),
            TimeoutPhase::Acquire => f.write_str("pool acquire"),
            TimeoutPhase::Request => f.write_str("request"),
        }
    }
}

/// Classification of an error status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 4xx
    Client,
    /// 5xx
    Server,
}

impl StatusClass {
    /// Classify a status code; `None` unless it is 4xx or 5xx.
    pub fn of(status: StatusCode) -> Option<Self> {
        if status.is_client_error() {
            Some(StatusClass::Client)
        } else if status.is_server_error() {
            Some(StatusClass::Server)
        } else {
            None
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusClass::Client => f.write_str("Client"),
            StatusClass::Server => f.write_str("Server"),
        }
    }
}

/// A response whose status was turned into an error on request.
#[derive(Debug, Error)]
pub struct HttpStatusError {
    class: StatusClass,
    response: Response,
}

impl HttpStatusError {
    pub(crate) fn new(class: StatusClass, response: Response) -> Self {
        Self { class, response }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Whether this was a client or server error.
    pub fn class(&self) -> StatusClass {
        self.class
    }

    /// The response that carried the error status.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Take back the response.
    pub fn into_response(self) -> Response {
        self.response
    }
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} Error: {} for url: {}",
            self.status().as_u16(),
            self.class,
            self.response.reason(),
            self.response.url()
        )
    }
}

/// Errors returned by sessions and requests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The URL could not be parsed or is not an http(s) URL.
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The request options were rejected.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Resolving, connecting, or socket I/O failed.
    #[error(transparent)]
    Connection(ConnectionError),

    /// A deadline expired.
    #[error("{phase} timed out after {after:?}")]
    Timeout {
        /// Which deadline.
        phase: TimeoutPhase,
        /// The configured duration.
        after: Duration,
    },

    /// The server sent a malformed response.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The redirect chain was longer than allowed.
    #[error("exceeded {max} redirects (last location: {url})")]
    TooManyRedirects {
        /// The configured maximum.
        max: usize,
        /// The redirect target that was not followed.
        url: String,
    },

    /// A 4xx or 5xx status, raised by [`Response::error_for_status`].
    #[error(transparent)]
    Status(Box<HttpStatusError>),

    /// The session or pool has been closed.
    #[error("session is closed")]
    Closed,

    /// A body could not be serialized or deserialized as JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A body could not be form-encoded.
    #[error("form encoding error: {0}")]
    Form(#[from] serde_urlencoded::ser::Error),

    /// The task running one request of a batch panicked or was cancelled.
    #[error("request task failed: {0}")]
    TaskFailed(String),
}

impl Error {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Error::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether any deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Whether the error came from resolving, connecting, or socket I/O.
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// Whether the server sent malformed data.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Whether this is a redirect-limit error.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::TooManyRedirects { .. })
    }

    /// The status code, for [`Error::Status`].
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status(error) => Some(error.status()),
            _ => None,
        }
    }
}

impl From<ConnectionError> for Error {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectTimeout { after, .. } => Error::Timeout {
                phase: TimeoutPhase::Connect,
                after,
            },
            error => Error::Connection(error),
        }
    }
}

impl From<CodecError> for Error {
    fn from(error: CodecError) -> Self {
        match error {
            CodecError::Protocol(error) => Error::Protocol(error),
            CodecError::Io(error) => Error::Connection(ConnectionError::Io(error)),
        }
    }
}

impl From<HttpStatusError> for Error {
    fn from(error: HttpStatusError) -> Self {
        Error::Status(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, std::error::Error);
    assert_impl_all!(ConnectionError: Send, Sync, std::error::Error);

    #[test]
    fn connect_timeout_is_a_timeout() {
        let error = Error::from(ConnectionError::ConnectTimeout {
            addr: ([127, 0, 0, 1], 80).into(),
            after: Duration::from_secs(1),
        });
        assert!(error.is_timeout());
        assert!(matches!(
            error,
            Error::Timeout {
                phase: TimeoutPhase::Connect,
                ..
            }
        ));
    }

    #[test]
    fn codec_errors_split_by_kind() {
        let error = Error::from(CodecError::Protocol(ProtocolError::ChunkSize));
        assert!(error.is_protocol());

        let error = Error::from(CodecError::Io(io::ErrorKind::ConnectionReset.into()));
        assert!(error.is_connect());
    }

    #[test]
    fn timeout_display() {
        let error = Error::Timeout {
            phase: TimeoutPhase::Acquire,
            after: Duration::from_millis(50),
        };
        assert_eq!(error.to_string(), "pool acquire timed out after 50ms");
    }
}
