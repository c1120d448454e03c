//! Sessions: default headers, credentials and cookies in front of a connection pool.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::RwLock;
use tracing::debug;

use super::auth::Auth;
use super::batch;
use super::builder::SessionBuilder;
use super::config::SessionConfig;
use super::cookies::CookieJar;
use super::error::Error;
use super::executor::Executor;
use super::pool::Pool;
use super::request::{Request, RequestOptions};
use super::response::Response;

/// An HTTP session.
///
/// A session owns a connection pool, a cookie jar, default headers and optional default
/// credentials. Requests made through it share connections. Values given with a request win
/// over the session's defaults.
///
/// Cloning is cheap and yields a handle to the same session. The session is closed by
/// [`Session::close`] or when the last handle is dropped; closing shuts every connection and
/// makes later requests fail with [`Error::Closed`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    headers: RwLock<HeaderMap>,
    auth: RwLock<Option<Auth>>,
    jar: Arc<CookieJar>,
    executor: Executor,
    config: Arc<SessionConfig>,
    closed: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.executor.pool().close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("headers", &*self.inner.headers.read())
            .field("pool", self.inner.executor.pool())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! method {
    ($(#[$doc:meta])* $name:ident, $method:expr) => {
        $(#[$doc])*
        pub async fn $name(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
            self.request($method, url, options).await
        }
    };
}

impl Session {
    /// A session with the default configuration.
    pub fn new() -> Self {
        SessionBuilder::new().build()
    }

    /// Start configuring a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub(crate) fn from_parts(
        executor: Executor,
        jar: Arc<CookieJar>,
        config: Arc<SessionConfig>,
        headers: HeaderMap,
        auth: Option<Auth>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                headers: RwLock::new(headers),
                auth: RwLock::new(auth),
                jar,
                executor,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    method!(
        /// Send a GET request.
        get,
        Method::GET
    );
    method!(
        /// Send a POST request.
        post,
        Method::POST
    );
    method!(
        /// Send a PUT request.
        put,
        Method::PUT
    );
    method!(
        /// Send a DELETE request.
        delete,
        Method::DELETE
    );
    method!(
        /// Send a PATCH request.
        patch,
        Method::PATCH
    );
    method!(
        /// Send a HEAD request.
        head,
        Method::HEAD
    );
    method!(
        /// Send an OPTIONS request.
        options,
        Method::OPTIONS
    );

    /// Send a request with any method.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        self.execute(Request::new(method, url, options)?).await
    }

    /// Send a prepared request.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        let request = self.prepare(request)?;
        self.inner.executor.execute(request).await
    }

    /// GET every URL concurrently with the same options. Results are in input order; a URL
    /// that fails only fails its own slot.
    pub async fn bulk_get<I>(&self, urls: I, options: RequestOptions) -> Vec<Result<Response, Error>>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let requests = urls
            .into_iter()
            .map(|url| {
                Request::new(Method::GET, url.as_ref(), options.clone())
                    .and_then(|request| self.prepare(request))
            })
            .collect();
        batch::run(&self.inner.executor, requests).await
    }

    /// Send every request concurrently. Results are in input order.
    pub async fn bulk<I>(&self, requests: I) -> Vec<Result<Response, Error>>
    where
        I: IntoIterator<Item = Request>,
    {
        let requests = requests
            .into_iter()
            .map(|request| self.prepare(request))
            .collect();
        batch::run(&self.inner.executor, requests).await
    }

    /// Close the session and every connection in its pool. Closing twice is harmless.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("closing session");
            self.inner.executor.pool().close();
        }
    }

    /// Whether the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// A copy of the default headers.
    pub fn headers(&self) -> HeaderMap {
        self.inner.headers.read().clone()
    }

    /// Set a default header, replacing any previous value.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.headers.write().insert(name, value);
    }

    /// Remove a default header.
    pub fn remove_header(&self, name: &HeaderName) {
        self.inner.headers.write().remove(name);
    }

    /// Set or clear the default credentials.
    pub fn set_auth(&self, auth: Option<Auth>) {
        *self.inner.auth.write() = auth;
    }

    /// The session's cookies.
    pub fn cookies(&self) -> &CookieJar {
        &self.inner.jar
    }

    /// The session's connection pool.
    pub fn pool(&self) -> &Pool {
        self.inner.executor.pool()
    }

    /// The session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Merge session defaults into `request`; anything the request already carries wins.
    fn prepare(&self, mut request: Request) -> Result<Request, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        {
            let defaults = self.inner.headers.read();
            for name in defaults.keys() {
                if !request.headers.contains_key(name) {
                    for value in defaults.get_all(name) {
                        request.headers.append(name.clone(), value.clone());
                    }
                }
            }
        }

        match request.auth.clone() {
            Some(auth) => auth.apply(&mut request)?,
            None if !request.headers.contains_key(AUTHORIZATION) => {
                let auth = self.inner.auth.read().clone();
                if let Some(auth) = auth {
                    auth.apply(&mut request)?;
                }
            }
            None => {}
        }

        Ok(request)
    }
}
