//! Connection Pooling for Clients
//!
//! The pool keeps connections to each destination (scheme, host and port) open between
//! requests, so that later requests to the same destination skip the connect and TLS
//! handshake. At most `max_connections_per_host` connections are open or being opened per
//! destination; callers beyond that wait in arrival order for a connection to be released.
//!
//! Connections are checked out as [`Pooled`] handles, which return the connection to the pool
//! when released or dropped. A connection only goes back into circulation when the exchange on
//! it completed and the server allowed keep-alive; otherwise it is closed and its slot is freed.
//!
//! Pool configuration happens in the [`Config`] type.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::trace;

mod idle;
mod key;
mod lock;
mod manager;

pub use self::key::{DestinationKey, Scheme};

use self::lock::{ArcMutex, WeakMutex};
use self::manager::{Checkout, Handoff, Manager};
use super::conn::{Connection, Connector};
use super::error::{Error, TimeoutPhase};
use crate::notify;

/// Configuration for a connection pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of connections open or being opened per destination.
    pub max_connections_per_host: usize,

    /// The maximum idle duration of a connection.
    #[serde(deserialize_with = "crate::client::config::secs::option")]
    pub idle_timeout: Option<Duration>,

    /// How long to wait for a connection when a destination is at capacity.
    #[serde(deserialize_with = "crate::client::config::secs::option")]
    pub acquire_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_per_host: 30,
            idle_timeout: Some(Duration::from_secs(30)),
            acquire_timeout: None,
        }
    }
}

/// A snapshot of one destination's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked and ready for reuse.
    pub idle: usize,

    /// Connections open or being opened, idle ones included.
    pub total: usize,

    /// Callers waiting for a connection.
    pub waiting: usize,
}

/// A pool of connections to remote hosts.
///
/// Cloning a pool is cheap and yields a handle to the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    managers: Mutex<HashMap<DestinationKey, ArcMutex<Manager>>>,
    config: Arc<Config>,
    connector: Connector,
    closed: AtomicBool,
    trigger: Mutex<notify::Trigger>,
    signal: notify::Signal,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("connector", &self.inner.connector)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Pool {
    /// Create an empty pool which opens connections with `connector`.
    pub fn new(config: Config, connector: Connector) -> Self {
        let (trigger, signal) = notify::channel();
        Self {
            inner: Arc::new(PoolInner {
                managers: Mutex::new(HashMap::new()),
                config: Arc::new(config),
                connector,
                closed: AtomicBool::new(false),
                trigger: Mutex::new(trigger),
                signal,
            }),
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Check out a connection to `key`.
    ///
    /// 1. An idle connection which is still open is reused, most recently returned first.
    /// 2. Otherwise, below the per-destination limit, a new connection is opened.
    /// 3. Otherwise the caller waits until a connection is released or a slot frees up.
    ///
    /// Waiting is bounded by the configured `acquire_timeout`, if any.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%key), level = "debug"))]
    pub async fn acquire(&self, key: &DestinationKey) -> Result<Pooled, Error> {
        match self.inner.config.acquire_timeout {
            Some(after) => tokio::time::timeout(after, self.checkout(key))
                .await
                .map_err(|_| Error::Timeout {
                    phase: TimeoutPhase::Acquire,
                    after,
                })?,
            None => self.checkout(key).await,
        }
    }

    async fn checkout(&self, key: &DestinationKey) -> Result<Pooled, Error> {
        // The map stays locked while the manager is consulted, so eviction cannot drop a
        // manager between lookup and checkout. `close` sets the flag before it collects the
        // managers under this lock, so no manager can be created after it.
        let (checkout, handle) = {
            let mut managers = self.inner.managers.lock();
            if self.is_closed() {
                return Err(Error::Closed);
            }
            let mut manager = managers
                .entry(key.clone())
                .or_insert_with(|| {
                    ArcMutex::new(Manager::new(key.clone(), self.inner.config.clone()))
                })
                .lock();
            (manager.checkout(), manager.downgrade())
        };

        let slot = match checkout {
            Checkout::Idle(connection) => return Ok(Pooled::new(connection, handle)),
            Checkout::Connect => SlotGuard::new(handle),
            Checkout::Wait(rx) => match rx.await {
                Ok(Handoff::Connection(pooled)) => {
                    trace!(id = %pooled.id(), "received released connection");
                    return Ok(pooled);
                }
                Ok(Handoff::Slot(slot)) => slot,
                Err(_) => return Err(Error::Closed),
            },
            Checkout::Closed => return Err(Error::Closed),
        };

        let connection = self.inner.connector.connect(key).await?;
        Ok(slot.fill(connection))
    }

    /// Drop idle connections past the idle timeout. Returns how many were closed.
    pub fn evict_stale(&self) -> usize {
        let mut managers = self.inner.managers.lock();
        let mut evicted = 0;
        managers.retain(|_, manager| {
            let mut manager = manager.lock();
            evicted += manager.evict();
            !manager.is_unused()
        });

        if evicted > 0 {
            trace!(evicted, "evicted stale connections");
        }
        evicted
    }

    /// Bookkeeping for one destination.
    pub fn stats(&self, key: &DestinationKey) -> PoolStats {
        let manager = self.inner.managers.lock().get(key).cloned();
        manager
            .map(|manager| manager.lock().stats())
            .unwrap_or_default()
    }

    /// Close every idle connection, fail every waiter with [`Error::Closed`], and signal
    /// requests in flight to stop. Later checkouts fail with [`Error::Closed`].
    ///
    /// Closing more than once has no further effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        trace!("closing pool");
        self.inner.trigger.lock().fire();
        let managers: Vec<_> = self.inner.managers.lock().values().cloned().collect();
        for manager in managers {
            manager.lock().close();
        }
    }

    /// Whether [`Pool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolves once the pool is closed.
    pub(crate) fn closed(&self) -> notify::Signal {
        self.inner.signal.clone()
    }
}

/// Wrapper type for a connection which is managed by a pool.
///
/// Release the connection with [`Pooled::release`] once the exchange is done; dropping the
/// handle releases it too, keeping it only if [`Connection::is_reusable`] says so. The
/// underlying connection is available via `Deref` and `DerefMut`.
pub struct Pooled {
    connection: Option<Connection>,
    manager: WeakMutex<Manager>,
}

impl Pooled {
    fn new(mut connection: Connection, manager: WeakMutex<Manager>) -> Self {
        connection.set_state(crate::client::conn::ConnectionState::InUse);
        Self {
            connection: Some(connection),
            manager,
        }
    }

    /// Hand the connection back.
    ///
    /// With `reusable` set, a connection that is still fit for another request returns to
    /// circulation; otherwise it is closed and its slot freed.
    pub fn release(mut self, reusable: bool) {
        self.finish(reusable);
    }

    fn finish(&mut self, reusable: bool) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        let Some(mut manager) = self.manager.lock() else {
            trace!(id = %connection.id(), "pool dropped, closing connection");
            return;
        };

        if reusable && connection.is_reusable() {
            trace!(id = %connection.id(), "connection returned to pool");
            manager.push(connection, &self.manager);
        } else {
            trace!(id = %connection.id(), "closing released connection");
            connection.close();
            drop(connection);
            manager.release_slot(&self.manager);
        }
    }

    /// Take the connection out without returning it.
    fn disarm(mut self) -> Option<Connection> {
        self.connection.take()
    }
}

impl fmt::Debug for Pooled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.connection).finish()
    }
}

impl Deref for Pooled {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection only taken on release")
    }
}

impl DerefMut for Pooled {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection only taken on release")
    }
}

impl Drop for Pooled {
    fn drop(&mut self) {
        let reusable = self
            .connection
            .as_ref()
            .is_some_and(|connection| connection.is_reusable());
        self.finish(reusable);
    }
}

/// A reserved slot for a connection which has not been opened yet.
///
/// Dropping the guard without filling it frees the slot, handing it to the next waiter.
#[derive(Debug)]
pub(super) struct SlotGuard {
    manager: WeakMutex<Manager>,
    armed: bool,
}

impl SlotGuard {
    fn new(manager: WeakMutex<Manager>) -> Self {
        Self {
            manager,
            armed: true,
        }
    }

    /// Occupy the slot with a freshly opened connection.
    fn fill(mut self, connection: Connection) -> Pooled {
        self.armed = false;
        Pooled::new(connection, self.manager.clone())
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Some(mut manager) = self.manager.lock() {
            trace!("unused slot released");
            manager.release_slot(&self.manager);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use static_assertions::assert_impl_all;

    use crate::client::codec::RequestHead;
    use crate::client::conn::{StaticResolver, TcpTransport};
    use crate::client::body::Body;
    use crate::fixtures::{Reply, TestServer};

    assert_impl_all!(Pool: Clone, Send, Sync);
    assert_impl_all!(Pooled: Send);

    fn pool_for(server: &TestServer, config: Config) -> (Pool, DestinationKey) {
        let connector = Connector::new(
            Arc::new(StaticResolver::new(server.addr())),
            TcpTransport::default(),
        );
        let key = DestinationKey::new(Scheme::Http, "pool.test", server.addr().port());
        (Pool::new(config, connector), key)
    }

    fn config(max: usize) -> Config {
        Config {
            max_connections_per_host: max,
            ..Config::default()
        }
    }

    async fn get(conn: &mut Pooled) -> crate::client::codec::ResponseParts {
        let mut head = RequestHead::new(http::Method::GET, "/");
        head.headers
            .insert(http::header::HOST, http::HeaderValue::from_static("pool.test"));
        conn.send_request(head, Body::Empty).await.unwrap()
    }

    #[test]
    fn sensible_config() {
        let config = Config::default();
        assert_eq!(config.max_connections_per_host, 30);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert!(config.acquire_timeout.is_none());
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        crate::fixtures::subscribe();
        let server = TestServer::start(|_| Reply::ok("hi")).await;
        let (pool, key) = pool_for(&server, config(4));

        let mut conn = pool.acquire(&key).await.unwrap();
        let id = conn.id();
        get(&mut conn).await;
        conn.release(true);

        assert_eq!(pool.stats(&key), PoolStats { idle: 1, total: 1, waiting: 0 });

        let mut conn = pool.acquire(&key).await.unwrap();
        assert_eq!(conn.id(), id, "connection should be re-used");
        get(&mut conn).await;
        drop(conn);

        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn connection_close_is_never_reused() {
        let server = TestServer::start(|_| Reply::ok("bye").close()).await;
        let (pool, key) = pool_for(&server, config(4));

        let mut conn = pool.acquire(&key).await.unwrap();
        let first = conn.id();
        let parts = get(&mut conn).await;
        assert!(!parts.keep_alive);
        conn.release(true);
        assert_eq!(pool.stats(&key), PoolStats::default());

        let mut conn = pool.acquire(&key).await.unwrap();
        assert_ne!(conn.id(), first);
        get(&mut conn).await;
        drop(conn);

        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn waiter_receives_released_connection() {
        let server = TestServer::start(|_| Reply::ok("")).await;
        let (pool, key) = pool_for(&server, config(1));

        let conn = pool.acquire(&key).await.unwrap();
        let id = conn.id();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            let key = key.clone();
            async move { pool.acquire(&key).await.map(|conn| conn.id()) }
        });

        while pool.stats(&key).waiting == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats(&key).total, 1);

        conn.release(true);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn waiter_gets_slot_when_connection_closes() {
        let server = TestServer::start(|_| Reply::ok("")).await;
        let (pool, key) = pool_for(&server, config(1));

        let conn = pool.acquire(&key).await.unwrap();
        let id = conn.id();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            let key = key.clone();
            async move { pool.acquire(&key).await.map(|conn| conn.id()) }
        });

        while pool.stats(&key).waiting == 0 {
            tokio::task::yield_now().await;
        }

        conn.release(false);
        assert_ne!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn acquire_timeout() {
        let server = TestServer::start(|_| Reply::ok("")).await;
        let (pool, key) = pool_for(
            &server,
            Config {
                max_connections_per_host: 1,
                acquire_timeout: Some(Duration::from_millis(50)),
                ..Config::default()
            },
        );

        let _held = pool.acquire(&key).await.unwrap();
        let error = pool.acquire(&key).await.unwrap_err();
        assert!(matches!(
            error,
            Error::Timeout {
                phase: TimeoutPhase::Acquire,
                ..
            }
        ));
        assert_eq!(pool.stats(&key).waiting, 0);
    }

    #[tokio::test]
    async fn close_fails_waiters_and_later_checkouts() {
        let server = TestServer::start(|_| Reply::ok("")).await;
        let (pool, key) = pool_for(&server, config(1));

        let held = pool.acquire(&key).await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            let key = key.clone();
            async move { pool.acquire(&key).await.map(|conn| conn.id()) }
        });
        while pool.stats(&key).waiting == 0 {
            tokio::task::yield_now().await;
        }

        pool.close();
        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Closed)));
        assert!(matches!(pool.acquire(&key).await, Err(Error::Closed)));
        assert!(pool.closed().is_fired());

        drop(held);
        assert_eq!(pool.stats(&key).total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_racing_checkouts_leaves_no_open_manager() {
        let server = TestServer::start(|_| Reply::ok("")).await;
        let (pool, _) = pool_for(&server, config(1));

        let tasks: Vec<_> = (0..64)
            .map(|n| {
                let pool = pool.clone();
                let key = DestinationKey::new(Scheme::Http, format!("host-{n}.test"), server.addr().port());
                tokio::spawn(async move { pool.acquire(&key).await.map(|conn| conn.id()) })
            })
            .collect();
        tokio::task::yield_now().await;
        pool.close();
        for task in tasks {
            let _ = task.await.unwrap();
        }

        assert!(matches!(pool.acquire(&DestinationKey::new(Scheme::Http, "late.test", 80)).await, Err(Error::Closed)));
        let managers: Vec<_> = pool.inner.managers.lock().values().cloned().collect();
        for manager in managers {
            assert!(matches!(manager.lock().checkout(), Checkout::Closed));
        }
    }

    #[tokio::test]
    async fn evict_stale_connections() {
        let server = TestServer::start(|_| Reply::ok("")).await;
        let (pool, key) = pool_for(
            &server,
            Config {
                idle_timeout: Some(Duration::from_millis(10)),
                ..Config::default()
            },
        );

        let mut conn = pool.acquire(&key).await.unwrap();
        get(&mut conn).await;
        conn.release(true);
        assert_eq!(pool.stats(&key).idle, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.evict_stale(), 1);
        assert_eq!(pool.stats(&key), PoolStats::default());
    }

    #[tokio::test]
    async fn failed_connect_frees_the_slot() {
        let refused = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let connector = Connector::new(
            Arc::new(StaticResolver::new(refused)),
            TcpTransport::default(),
        );
        let key = DestinationKey::new(Scheme::Http, "refused.test", refused.port());
        let pool = Pool::new(config(1), connector);

        assert!(pool.acquire(&key).await.unwrap_err().is_connect());
        assert_eq!(pool.stats(&key).total, 0);
        assert!(pool.acquire(&key).await.unwrap_err().is_connect());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_host_limit_under_load() {
        crate::fixtures::subscribe();
        let server = TestServer::start(|_| Reply::ok("ok")).await;
        let (pool, key) = pool_for(&server, config(4));

        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..200 {
            let pool = pool.clone();
            let key = key.clone();
            let peak = peak.clone();
            tasks.spawn(async move {
                let mut conn = pool.acquire(&key).await.unwrap();
                peak.fetch_max(pool.stats(&key).total, Ordering::SeqCst);
                let parts = get(&mut conn).await;
                assert_eq!(parts.status, http::StatusCode::OK);
                conn.release(true);
            });
        }

        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert!(server.connections() <= 4);
        assert!(pool.stats(&key).total <= 4);
    }
}
