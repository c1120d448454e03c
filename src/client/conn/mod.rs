//! Connections and the machinery which opens them.
//!
//! - [`dns`] translates destination names into socket addresses
//! - [`transport`] opens TCP sockets and wraps them in TLS
//! - [`Connector`] couples the two and produces a [`Connection`]
//! - [`Connection`] carries HTTP/1.1 exchanges over one socket

pub mod connection;
pub mod connector;
pub mod dns;
pub mod transport;

pub use self::connection::{Connection, ConnectionId, ConnectionState};
pub use self::connector::Connector;
pub use self::dns::{CachingResolver, GaiResolver, Name, Resolve, SocketAddrs, StaticResolver};
pub use self::transport::{TcpTransport, TcpTransportConfig, TlsConnectionError};
