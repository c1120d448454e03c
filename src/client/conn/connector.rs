//! Connectors couple name resolution, a transport and optional TLS to create a connection.
//!
//! The pool calls [`Connector::connect`] whenever it has reserved a slot for a new connection.

use std::fmt;
use std::sync::Arc;

use tower::ServiceExt as _;
use tracing::{Instrument as _, trace};

use super::connection::Connection;
use super::dns::Resolve;
use super::transport::TcpTransport;
#[cfg(feature = "tls")]
use super::transport::TlsTransport;
#[cfg(not(feature = "tls"))]
use super::transport::TlsConnectionError;
use crate::client::codec::DEFAULT_MAX_HEADER_SIZE;
use crate::client::error::{ConnectionError, Error};
use crate::client::pool::{DestinationKey, Scheme};
use crate::stream::Stream;

/// Opens new connections to destinations.
#[derive(Clone)]
pub struct Connector {
    resolver: Arc<dyn Resolve>,
    transport: TcpTransport,
    #[cfg(feature = "tls")]
    tls: TlsTransport,
    max_header_size: usize,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("transport", &self.transport)
            .field("max_header_size", &self.max_header_size)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Create a connector for plain-text destinations.
    ///
    /// With the `tls` feature enabled, https destinations use the platform's root certificates.
    pub fn new(resolver: Arc<dyn Resolve>, transport: TcpTransport) -> Self {
        Self {
            resolver,
            transport,
            #[cfg(feature = "tls")]
            tls: TlsTransport::new(Arc::new(crate::client::default_tls_config())),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }

    /// Use the given TLS client configuration for https destinations.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = TlsTransport::new(config);
        self
    }

    /// Cap the size of response header blocks on new connections.
    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    /// Resolve, connect, and (for https) run the TLS handshake.
    pub async fn connect(&self, key: &DestinationKey) -> Result<Connection, Error> {
        let name = key.name();
        let addrs = self
            .resolver
            .resolve(name.clone())
            .instrument(tracing::trace_span!("resolve", %name))
            .await
            .map_err(|source| ConnectionError::Resolve {
                host: name.host().to_owned(),
                source,
            })?;

        if addrs.is_empty() {
            return Err(ConnectionError::NoAddresses {
                host: name.host().to_owned(),
            }
            .into());
        }

        trace!(count = addrs.len(), "connecting");
        let tcp = self.transport.clone().oneshot(addrs).await?;

        let stream = match key.scheme() {
            Scheme::Http => Stream::from(tcp),
            Scheme::Https => self.secure(key, tcp).await?,
        };

        Ok(Connection::new(key.clone(), stream, self.max_header_size))
    }

    #[cfg(feature = "tls")]
    async fn secure(
        &self,
        key: &DestinationKey,
        tcp: crate::stream::tcp::TcpStream,
    ) -> Result<Stream, ConnectionError> {
        let stream = self.tls.handshake(key.domain(), tcp, key.verify()).await?;
        Ok(Stream::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn secure(
        &self,
        _key: &DestinationKey,
        _tcp: crate::stream::tcp::TcpStream,
    ) -> Result<Stream, ConnectionError> {
        Err(TlsConnectionError::TlsDisabled.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::client::conn::dns::{Name, SocketAddrs, StaticResolver};

    #[tokio::test]
    async fn connects_through_resolver() {
        crate::fixtures::subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = Connector::new(Arc::new(StaticResolver::new(addr)), TcpTransport::default());
        let key = DestinationKey::new(Scheme::Http, "service.test", addr.port());

        let (conn, accepted) = tokio::join!(connector.connect(&key), listener.accept());
        let conn = conn.unwrap();
        accepted.unwrap();

        assert_eq!(conn.key(), &key);
        assert_eq!(*conn.info().remote_addr(), addr);
    }

    #[tokio::test]
    async fn empty_resolution_is_an_error() {
        let connector = Connector::new(
            Arc::new(StaticResolver::new(SocketAddrs::default())),
            TcpTransport::default(),
        );
        let key = DestinationKey::new(Scheme::Http, "nowhere.test", 80);

        let error = connector.connect(&key).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Connection(ConnectionError::NoAddresses { ref host }) if host == "nowhere.test"
        ));
    }

    #[tokio::test]
    async fn resolver_failures_are_reported() {
        let resolver = tower::service_fn(|_: Name| async {
            Err::<SocketAddrs, _>(std::io::Error::other("boom"))
        });
        let connector = Connector::new(Arc::new(resolver), TcpTransport::default());
        let key = DestinationKey::new(Scheme::Http, "broken.test", 80);

        let error = connector.connect(&key).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Connection(ConnectionError::Resolve { .. })
        ));
    }

    #[cfg(not(feature = "tls"))]
    #[tokio::test]
    async fn https_without_tls_feature() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = Connector::new(Arc::new(StaticResolver::new(addr)), TcpTransport::default());
        let key = DestinationKey::new(Scheme::Https, "secure.test", addr.port());

        let (result, _) = tokio::join!(connector.connect(&key), listener.accept());
        assert!(matches!(
            result,
            Err(Error::Connection(ConnectionError::Tls(
                TlsConnectionError::TlsDisabled
            )))
        ));
    }
}
