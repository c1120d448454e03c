//! Runs one request against the pool: checkout, exchange, release, and redirects.

use std::future::IntoFuture as _;
use std::sync::Arc;
use std::time::Instant;

use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, LOCATION, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tracing::{Instrument as _, debug};
use url::Url;

use super::body::Body;
use super::codec::RequestHead;
use super::config::SessionConfig;
use super::cookies::CookieJar;
use super::error::{Error, TimeoutPhase};
use super::pool::{DestinationKey, Pool};
use super::request::Request;
use super::response::Response;

/// Executes requests on a shared pool.
///
/// Cloning is cheap; clones share the pool, the cookie jar and the configuration.
#[derive(Debug, Clone)]
pub struct Executor {
    pool: Pool,
    jar: Arc<CookieJar>,
    config: Arc<SessionConfig>,
}

impl Executor {
    /// Create an executor on `pool`.
    pub fn new(pool: Pool, jar: Arc<CookieJar>, config: Arc<SessionConfig>) -> Self {
        Self { pool, jar, config }
    }

    /// The pool connections are taken from.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Execute `request`, following redirects unless disabled.
    ///
    /// The request deadline covers every hop. When it expires, or when the pool is closed,
    /// the exchange in progress is abandoned and its connection is discarded.
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        let span = tracing::debug_span!("request", method = %request.method, url = %request.url);
        async move {
            let closed = self.pool.closed();
            if closed.is_fired() {
                return Err(Error::Closed);
            }

            let timeout = request.timeout.or(self.config.timeout);
            let exchange = async {
                match timeout {
                    Some(after) => match tokio::time::timeout(after, self.follow(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout {
                            phase: TimeoutPhase::Request,
                            after,
                        }),
                    },
                    None => self.follow(request).await,
                }
            };

            tokio::select! {
                result = exchange => result,
                () = closed.into_future() => Err(Error::Closed),
            }
        }
        .instrument(span)
        .await
    }

    async fn follow(&self, mut request: Request) -> Result<Response, Error> {
        let start = Instant::now();
        let allow = request.allow_redirects.unwrap_or(self.config.allow_redirects);
        let max = request.max_redirects.unwrap_or(self.config.max_redirects);
        let verify = request.verify.unwrap_or(self.config.verify);
        let mut history = Vec::new();

        loop {
            let replay = if allow { request.body.try_clone() } else { None };
            let body = std::mem::take(&mut request.body);
            let response = self
                .send(&request.method, &request.url, &request.headers, body, verify)
                .await?;

            if !allow || !response.is_redirect() {
                return Ok(response.with_history(history, start.elapsed()));
            }

            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            else {
                return Ok(response.with_history(history, start.elapsed()));
            };
            let next = request
                .url
                .join(location)
                .map_err(|error| Error::invalid_url(location, error))?;

            if history.len() >= max {
                return Err(Error::TooManyRedirects {
                    max,
                    url: next.into(),
                });
            }

            let status = response.status();
            if rewrites_to_get(status, &request.method) {
                request.method = Method::GET;
                for name in [CONTENT_TYPE, CONTENT_LENGTH, TRANSFER_ENCODING] {
                    request.headers.remove(name);
                }
            } else {
                match replay {
                    Some(body) => request.body = body,
                    None => {
                        debug!(%status, "streamed body cannot be replayed, not following");
                        return Ok(response.with_history(history, start.elapsed()));
                    }
                }
            }

            if !same_origin(&request.url, &next) {
                request.headers.remove(AUTHORIZATION);
                request.headers.remove(HOST);
            }

            debug!(%status, location = %next, "following redirect");
            history.push(std::mem::replace(&mut request.url, next));
        }
    }

    async fn send(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Body,
        verify: bool,
    ) -> Result<Response, Error> {
        let key = DestinationKey::from_url(url)?.with_verify(verify);
        let mut conn = self.pool.acquire(&key).await?;

        let mut head = RequestHead::new(method.clone(), target(url));
        if !headers.contains_key(HOST) {
            let host = HeaderValue::try_from(key.authority())
                .map_err(|error| Error::invalid_url(url.as_str(), error))?;
            head.headers.insert(HOST, host);
        }
        for (name, value) in headers {
            head.headers.append(name.clone(), value.clone());
        }
        if !head.headers.contains_key(COOKIE) {
            if let Some(cookies) = self.jar.header_for(url) {
                head.headers.insert(COOKIE, cookies);
            }
        }

        let result = conn.send_request(head, body).await;
        let reusable = result.as_ref().is_ok_and(|parts| parts.keep_alive) && conn.is_reusable();
        let id = conn.id();
        conn.release(reusable);

        let parts = result?;
        self.jar.store(url, &parts.headers);
        Ok(Response::new(parts, url.clone(), Some(id)))
    }
}

/// Origin-form request target: path and query, never the fragment.
fn target(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_owned(),
    }
}

/// 303 turns everything but HEAD into GET; 301 and 302 do so for POST and PATCH.
fn rewrites_to_get(status: StatusCode, method: &Method) -> bool {
    match status.as_u16() {
        303 => *method != Method::HEAD,
        301 | 302 => *method == Method::POST || *method == Method::PATCH,
        _ => false,
    }
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}
