//! Completed responses.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{Buf as _, Bytes};
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use url::Url;

use super::codec::{ResponseParts, latin1};
use super::conn::ConnectionId;
use super::error::{Error, HttpStatusError, StatusClass};

/// A fully read response.
///
/// The body is buffered, so a response can be cloned cheaply and inspected any number of
/// times.
#[derive(Clone)]
pub struct Response {
    status: StatusCode,
    reason: String,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    url: Url,
    elapsed: Duration,
    history: Vec<Url>,
    connection: Option<ConnectionId>,
    text: Arc<OnceLock<String>>,
}

impl Response {
    pub(crate) fn new(parts: ResponseParts, url: Url, connection: Option<ConnectionId>) -> Self {
        Self {
            status: parts.status,
            reason: parts.reason,
            version: parts.version,
            headers: parts.headers,
            body: parts.body,
            url,
            elapsed: Duration::ZERO,
            history: Vec::new(),
            connection,
            text: Arc::default(),
        }
    }

    pub(crate) fn with_history(mut self, history: Vec<Url>, elapsed: Duration) -> Self {
        self.history = history;
        self.elapsed = elapsed;
        self
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response status as a number.
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Whether the status is below 400.
    pub fn ok(&self) -> bool {
        self.status.as_u16() < 400
    }

    /// Reason phrase sent by the server, or the canonical one if it sent none.
    pub fn reason(&self) -> &str {
        if self.reason.is_empty() {
            self.status.canonical_reason().unwrap_or("")
        } else {
            &self.reason
        }
    }

    /// Protocol version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The URL that produced this response, after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Time from the start of the request to the end of the final response.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Number of redirects followed to reach this response.
    pub fn redirects(&self) -> usize {
        self.history.len()
    }

    /// URLs that answered with a redirect, in order.
    pub fn history(&self) -> &[Url] {
        &self.history
    }

    /// The connection that carried the final exchange.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Raw body.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Charset named by the `Content-Type` header, lowercased.
    pub fn encoding(&self) -> Option<String> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        content_type.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
        })
    }

    /// Body decoded as text.
    ///
    /// Latin-1 charsets are decoded byte for byte; everything else is read as UTF-8 with
    /// invalid sequences replaced.
    pub fn text(&self) -> &str {
        self.text.get_or_init(|| match self.encoding().as_deref() {
            Some("iso-8859-1" | "latin1" | "latin-1" | "us-ascii" | "ascii") => latin1(&self.body),
            _ => String::from_utf8_lossy(&self.body).into_owned(),
        })
    }

    /// Body parsed as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Whether this is a redirect with a `Location` header.
    pub fn is_redirect(&self) -> bool {
        self.headers.contains_key(LOCATION)
            && matches!(self.status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }

    /// Whether this is a 301 or 308 redirect with a `Location` header.
    pub fn is_permanent_redirect(&self) -> bool {
        self.headers.contains_key(LOCATION) && matches!(self.status.as_u16(), 301 | 308)
    }

    /// Turn a 4xx or 5xx response into an error.
    pub fn error_for_status(self) -> Result<Self, Error> {
        match StatusClass::of(self.status) {
            Some(class) => Err(HttpStatusError::new(class, self).into()),
            None => Ok(self),
        }
    }

    /// Like [`Response::error_for_status`], keeping the response.
    pub fn raise_for_status(&self) -> Result<(), Error> {
        match StatusClass::of(self.status) {
            Some(class) => Err(HttpStatusError::new(class, self.clone()).into()),
            None => Ok(()),
        }
    }

    /// Iterate over the body in pieces of at most `size` bytes. A `size` of zero is treated as one.
    pub fn chunks(&self, size: usize) -> Chunks {
        Chunks {
            body: self.body.clone(),
            size: size.max(1),
        }
    }

    /// Iterate over the non-empty lines of the body, without line terminators.
    pub fn lines(&self) -> Lines {
        Lines {
            body: self.body.clone(),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.body.len())
            .finish_non_exhaustive()
    }
}

/// Iterator returned by [`Response::chunks`].
#[derive(Debug, Clone)]
pub struct Chunks {
    body: Bytes,
    size: usize,
}

impl Iterator for Chunks {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.body.is_empty() {
            return None;
        }
        let at = self.size.min(self.body.len());
        Some(self.body.split_to(at))
    }
}

/// Iterator returned by [`Response::lines`].
#[derive(Debug, Clone)]
pub struct Lines {
    body: Bytes,
}

impl Iterator for Lines {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        while !self.body.is_empty() {
            let mut line = match self.body.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    let line = self.body.split_to(end);
                    self.body.advance(1);
                    line
                }
                None => self.body.split_off(0),
            };
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }
}
