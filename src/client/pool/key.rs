//! Destination keys identify pool buckets.

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::client::conn::dns::Name;
use crate::client::error::Error;

/// URL scheme of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain-text HTTP.
    Http,
    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// The scheme as it appears in a URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// Port used when a URL does not name one.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(scheme, host, port)` of a connection.
///
/// Requests with equal keys may share a connection; requests with different keys never do.
/// For https destinations the key also records whether the peer certificate was verified, so
/// that a connection opened without verification is never handed to a request that requires it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    scheme: Scheme,
    host: Arc<str>,
    port: u16,
    verify: bool,
}

impl DestinationKey {
    /// Create a key for a verified destination.
    pub fn new(scheme: Scheme, host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            verify: true,
        }
    }

    /// Derive the key for a URL.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::invalid_url(
                    url.as_str(),
                    format!("unsupported scheme {other:?}"),
                ));
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::invalid_url(url.as_str(), "missing host"))?;
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host, port))
    }

    /// Set whether the peer certificate must be verified. Has no effect for plain http.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify || self.scheme == Scheme::Http;
        self
    }

    /// Destination scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Destination host, as written in the URL (IPv6 literals keep their brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the peer certificate is verified.
    pub fn verify(&self) -> bool {
        self.verify
    }

    /// Value for the `Host` header: the host alone on the scheme's default port, else `host:port`.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The name to hand to a resolver.
    pub fn name(&self) -> Name {
        Name::new(self.domain(), self.port)
    }

    /// The bare host, used for resolution and TLS server name indication.
    pub(crate) fn domain(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}
