//! Transport streams for connecting to remote servers.
//!
//! Transports are responsible for establishing a connection to a remote server and shuffling
//! bytes back and forth. Plain TCP is always available; TLS is layered on top when the `tls`
//! feature is enabled.

use thiserror::Error;

pub use self::tcp::{TcpTransport, TcpTransportConfig};
#[cfg(feature = "tls")]
pub use self::tls::TlsTransport;

pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;

/// An error returned when a TLS connection attempt fails
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsConnectionError {
    /// An error occured during the TLS handshake.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// The host is not a valid TLS server name.
    #[error("invalid TLS server name {0:?}")]
    InvalidDomain(String),

    /// The TLS feature is disabled, but TLS was requested.
    #[error("TLS is not enabled, can't connect to https")]
    TlsDisabled,
}
