//! Builder pattern for sessions

use std::fmt;
use std::sync::Arc;

use http::header::{ACCEPT, ACCEPT_ENCODING, CONNECTION, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use super::auth::Auth;
use super::config::SessionConfig;
use super::conn::{CachingResolver, Connector, GaiResolver, Resolve, TcpTransport};
use super::cookies::CookieJar;
use super::executor::Executor;
use super::pool::Pool;
use super::session::Session;

/// Builder-pattern for sessions
pub struct SessionBuilder {
    config: SessionConfig,
    resolver: Option<Arc<dyn Resolve>>,
    headers: HeaderMap,
    auth: Option<Auth>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("custom_resolver", &self.resolver.is_some())
            .field("headers", &self.headers)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    /// Create a new builder with the default configuration.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::default(),
            resolver: None,
            headers: HeaderMap::new(),
            auth: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Resolve host names with `resolver` instead of the system resolver.
    ///
    /// Custom resolvers are used as given; wrap them in a [`CachingResolver`] to cache answers.
    pub fn with_resolver<R: Resolve>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Send `value` as the `name` header on every request, unless the request sets it.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Authenticate every request that does not bring its own credentials.
    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Use the given TLS client configuration for https destinations.
    #[cfg(feature = "tls")]
    pub fn with_tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Build the session.
    pub fn build(self) -> Session {
        let config = Arc::new(self.config);

        let resolver: Arc<dyn Resolve> = match (self.resolver, config.dns_cache_ttl) {
            (Some(resolver), _) => resolver,
            (None, Some(ttl)) => Arc::new(CachingResolver::new(GaiResolver::new(), ttl)),
            (None, None) => Arc::new(GaiResolver::new()),
        };

        let connector = Connector::new(resolver, TcpTransport::new(Arc::new(config.tcp.clone())))
            .with_max_header_size(config.max_header_size);
        #[cfg(feature = "tls")]
        let connector = match self.tls {
            Some(tls) => connector.with_tls(tls),
            None => connector,
        };

        let pool = Pool::new(config.pool.clone(), connector);
        let jar = Arc::new(CookieJar::new());
        let executor = Executor::new(pool, jar.clone(), config.clone());

        let mut headers = default_headers(&config);
        for (name, value) in self.headers {
            if let Some(name) = name {
                headers.insert(name, value);
            }
        }

        Session::from_parts(executor, jar, config, headers, self.auth)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_headers(config: &SessionConfig) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(4);
    match HeaderValue::try_from(config.user_agent.as_str()) {
        Ok(agent) => {
            headers.insert(USER_AGENT, agent);
        }
        Err(_) => warn!(user_agent = %config.user_agent, "ignoring invalid user agent"),
    }
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(SessionBuilder: Send, fmt::Debug);

    #[test]
    fn defaults() {
        let headers = default_headers(&SessionConfig::default());
        assert!(headers[USER_AGENT].to_str().unwrap().starts_with("carafe/"));
        assert_eq!(headers[ACCEPT], "*/*");
        assert_eq!(headers[ACCEPT_ENCODING], "identity");
        assert_eq!(headers[CONNECTION], "keep-alive");
    }

    #[test]
    fn invalid_user_agent_is_skipped() {
        let config = SessionConfig {
            user_agent: "bad\nagent".into(),
            ..SessionConfig::default()
        };
        assert!(default_headers(&config).get(USER_AGENT).is_none());
    }

    #[tokio::test]
    async fn builder_headers_replace_defaults() {
        let session = SessionBuilder::new()
            .with_header(USER_AGENT, HeaderValue::from_static("custom/1"))
            .with_header(
                HeaderName::from_static("x-team"),
                HeaderValue::from_static("core"),
            )
            .build();

        let headers = session.headers();
        assert_eq!(headers[USER_AGENT], "custom/1");
        assert_eq!(headers["x-team"], "core");
        assert_eq!(headers.get_all(USER_AGENT).iter().count(), 1);
    }

    #[tokio::test]
    async fn pool_config_is_applied() {
        let mut config = SessionConfig::default();
        config.pool.max_connections_per_host = 3;
        let session = SessionBuilder::new().with_config(config).build();
        assert_eq!(session.pool().config().max_connections_per_host, 3);
    }
}
