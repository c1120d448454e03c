//! Session configuration.
//!
//! Every section can be loaded with serde; missing fields take their defaults and unknown
//! fields are rejected. Durations are written as (fractional) seconds.

use std::time::Duration;

use serde::Deserialize;

use super::codec::DEFAULT_MAX_HEADER_SIZE;
use super::conn::TcpTransportConfig;
use super::conn::dns::DEFAULT_DNS_TTL;
use super::pool::Config as PoolConfig;

/// Default number of redirects followed before giving up.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Configuration for a [`crate::Session`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Connection pool limits.
    pub pool: PoolConfig,

    /// Socket options for new connections.
    pub tcp: TcpTransportConfig,

    /// Default deadline for a whole request, redirects included.
    #[serde(deserialize_with = "secs::option")]
    pub timeout: Option<Duration>,

    /// Whether redirects are followed unless a request says otherwise.
    pub allow_redirects: bool,

    /// Redirects followed before failing with [`crate::Error::TooManyRedirects`].
    pub max_redirects: usize,

    /// Whether TLS peer certificates are verified unless a request says otherwise.
    pub verify: bool,

    /// Value of the `User-Agent` header sent with every request.
    pub user_agent: String,

    /// Largest response header block accepted, in bytes.
    pub max_header_size: usize,

    /// How long resolved addresses are cached. `None` disables the cache.
    #[serde(deserialize_with = "secs::option")]
    pub dns_cache_ttl: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            tcp: TcpTransportConfig::default(),
            timeout: None,
            allow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            verify: true,
            user_agent: concat!("carafe/", env!("CARGO_PKG_VERSION")).to_owned(),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            dns_cache_ttl: Some(DEFAULT_DNS_TTL),
        }
    }
}

/// Durations written as seconds.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize as _, Deserializer};

    pub(crate) fn option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_redirects, 10);
        assert_eq!(config.pool.max_connections_per_host, 30);
        assert_eq!(config.dns_cache_ttl, Some(Duration::from_secs(60)));
        assert!(config.user_agent.starts_with("carafe/"));
        assert!(config.verify);
    }

    #[test]
    fn nested_sections_from_json() {
        let config: SessionConfig = serde_json::from_str(
            r#"{
                "timeout": 1.5,
                "max_redirects": 3,
                "pool": {"max_connections_per_host": 4, "idle_timeout": null},
                "tcp": {"nodelay": false}
            }"#,
        )
        .unwrap();

        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.max_redirects, 3);
        assert_eq!(config.pool.max_connections_per_host, 4);
        assert_eq!(config.pool.idle_timeout, None);
        assert!(!config.tcp.nodelay);
        assert!(config.tcp.keepalive);
    }

    #[test]
    fn rejects_unknown_and_negative() {
        assert!(serde_json::from_str::<SessionConfig>(r#"{"retries": 3}"#).is_err());
        assert!(serde_json::from_str::<SessionConfig>(r#"{"timeout": -1}"#).is_err());
    }
}
