//! DNS resolution utilities.
//!
//! Connections find their peer through a [`Resolve`] capability. Any cloneable
//! [`tower::Service`] from [`Name`] to [`SocketAddrs`] can be used as one, which makes it easy
//! to plug in a custom resolver or a stub in tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::future::{Ready, ready};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tower::ServiceExt as _;
use tracing::{Instrument as _, trace};

use crate::BoxFuture;

/// Default lifetime of a cached DNS answer.
pub const DEFAULT_DNS_TTL: Duration = Duration::from_secs(60);

/// A collection of socket addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketAddrs(VecDeque<SocketAddr>);

impl SocketAddrs {
    /// The first address, if any.
    pub fn peek(&self) -> Option<SocketAddr> {
        self.0.front().copied()
    }

    pub(crate) fn pop(&mut self) -> Option<SocketAddr> {
        self.0.pop_front()
    }

    /// Whether there are no addresses.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<SocketAddr> for SocketAddrs {
    fn from(value: SocketAddr) -> Self {
        Self(VecDeque::from([value]))
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::collections::vec_deque::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A host and port to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    host: Arc<str>,
    port: u16,
}

impl Name {
    /// Create a name from a bare host (IPv6 literals without brackets) and port.
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The host to look up.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port every resolved address should carry.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Translate a [`Name`] into socket addresses.
pub trait Resolve: Send + Sync + 'static {
    /// Resolve `name`.
    fn resolve(&self, name: Name) -> BoxFuture<'static, io::Result<SocketAddrs>>;
}

impl<S> Resolve for S
where
    S: tower::Service<Name, Response = SocketAddrs, Error = io::Error>,
    S: Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    fn resolve(&self, name: Name) -> BoxFuture<'static, io::Result<SocketAddrs>> {
        Box::pin(self.clone().oneshot(name))
    }
}

/// Resolver backed by the system's `getaddrinfo`, run on the tokio blocking pool.
///
/// IP literals are returned without a lookup.
#[derive(Debug, Clone, Default)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a system resolver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl tower::Service<Name> for GaiResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<SocketAddrs>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let span = tracing::trace_span!("dns", host = %name.host);
        Box::pin(
            async move {
                if let Ok(ip) = name.host.parse::<IpAddr>() {
                    return Ok(SocketAddrs::from(SocketAddr::new(ip, name.port)));
                }

                let addrs: SocketAddrs = tokio::net::lookup_host((&*name.host, name.port))
                    .await?
                    .collect();
                trace!(count = addrs.len(), "resolved");
                Ok(addrs)
            }
            .instrument(span),
        )
    }
}

/// A static address resolver always returns the same addresses
/// and ignores the name.
///
/// This is useful for pinning a host name to a known location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticResolver {
    addrs: SocketAddrs,
}

impl StaticResolver {
    /// Create a new static-address resolver
    pub fn new(addrs: impl Into<SocketAddrs>) -> Self {
        Self {
            addrs: addrs.into(),
        }
    }
}

impl tower::Service<Name> for StaticResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = Ready<io::Result<SocketAddrs>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: Name) -> Self::Future {
        ready(Ok(self.addrs.clone()))
    }
}

#[derive(Debug, Clone)]
struct Cached {
    addrs: SocketAddrs,
    expires: Instant,
}

/// Caches answers from another resolver for a fixed time.
///
/// Empty answers and failures are not cached.
#[derive(Debug, Clone)]
pub struct CachingResolver<R> {
    inner: R,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<Name, Cached>>>,
}

impl<R> CachingResolver<R> {
    /// Wrap `inner`, keeping answers for `ttl`.
    pub fn new(inner: R, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lookup(&self, name: &Name) -> Option<SocketAddrs> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        match cache.get(name) {
            Some(entry) if entry.expires > now => Some(entry.addrs.clone()),
            Some(_) => {
                cache.remove(name);
                None
            }
            None => None,
        }
    }
}

impl<R> tower::Service<Name> for CachingResolver<R>
where
    R: tower::Service<Name, Response = SocketAddrs, Error = io::Error> + Clone + Send + 'static,
    R::Future: Send + 'static,
{
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<SocketAddrs>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        if let Some(addrs) = self.lookup(&name) {
            trace!(%name, "dns cache hit");
            return Box::pin(ready(Ok(addrs)));
        }

        let inner = self.inner.clone();
        let cache = self.cache.clone();
        let ttl = self.ttl;
        Box::pin(async move {
            let addrs = inner.oneshot(name.clone()).await?;
            if !addrs.is_empty() {
                let now = Instant::now();
                let mut cache = cache.lock();
                cache.retain(|_, entry| entry.expires > now);
                cache.insert(
                    name,
                    Cached {
                        addrs: addrs.clone(),
                        expires: now + ttl,
                    },
                );
            }
            Ok(addrs)
        })
    }
}
