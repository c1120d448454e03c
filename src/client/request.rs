//! Request descriptions and the options used to build them.
//!
//! A [`Request`] is built once from a method, a URL and a [`RequestOptions`] value, and is not
//! changed by the caller afterwards. The option set is closed: deserializing options with an
//! unknown field fails.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use url::Url;

use super::auth::Auth;
use super::body::Body;
use super::error::Error;
use super::pool::DestinationKey;

/// A request body given as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Text sent as is.
    Text(String),

    /// Bytes sent as is.
    Bytes(Bytes),

    /// Pairs sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Text(value.to_owned())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Text(value)
    }
}

impl From<Bytes> for Data {
    fn from(value: Bytes) -> Self {
        Data::Bytes(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Bytes(value.into())
    }
}

impl<K, V> From<Vec<(K, V)>> for Data
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(value: Vec<(K, V)>) -> Self {
        Data::Form(
            value
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DataVisitor;

        impl<'de> Visitor<'de> for DataVisitor {
            type Value = Data;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or form fields")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Data, E> {
                Ok(Data::Text(v.to_owned()))
            }

            fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Data, A::Error> {
                PairsVisitor.visit_map(map).map(Data::Form)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, seq: A) -> Result<Data, A::Error> {
                PairsVisitor.visit_seq(seq).map(Data::Form)
            }
        }

        deserializer.deserialize_any(DataVisitor)
    }
}

/// Options accepted by every request method.
///
/// Build one with the chaining methods, or deserialize it; unknown fields are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct RequestOptions {
    /// Pairs appended to the URL query string.
    #[serde(deserialize_with = "pairs")]
    pub params: Vec<(String, String)>,

    /// Headers for this request; they replace session defaults with the same name.
    #[serde(deserialize_with = "pairs")]
    pub headers: Vec<(String, String)>,

    /// Raw or form-encoded body.
    pub data: Option<Data>,

    /// Body serialized as JSON.
    pub json: Option<serde_json::Value>,

    /// Deadline for the whole request, connect and redirects included.
    #[serde(deserialize_with = "crate::client::config::secs::option")]
    pub timeout: Option<Duration>,

    /// Credentials applied before sending.
    pub auth: Option<Auth>,

    /// Whether the TLS peer certificate is verified.
    pub verify: Option<bool>,

    /// Whether redirects are followed.
    pub allow_redirects: Option<bool>,

    /// How many redirects are followed before failing.
    pub max_redirects: Option<usize>,
}

impl RequestOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a query parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Send `data` as the body.
    pub fn data(mut self, data: impl Into<Data>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Send `value` serialized as JSON.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, Error> {
        self.json = Some(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set the request deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the credentials.
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Set whether the TLS peer certificate is verified.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = Some(verify);
        self
    }

    /// Set whether redirects are followed.
    pub fn allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = Some(allow);
        self
    }

    /// Set how many redirects are followed.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = Some(max);
        self
    }
}

/// A request, ready to be executed.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) timeout: Option<Duration>,
    pub(crate) auth: Option<Auth>,
    pub(crate) verify: Option<bool>,
    pub(crate) allow_redirects: Option<bool>,
    pub(crate) max_redirects: Option<usize>,
}

impl Request {
    /// Build a request from a method, a URL and options.
    ///
    /// Fails if the URL is not an absolute http(s) URL, if a header is invalid, or if both
    /// `data` and `json` are given.
    pub fn new(method: Method, url: &str, options: RequestOptions) -> Result<Self, Error> {
        let mut url = Url::parse(url).map_err(|error| Error::invalid_url(url, error))?;
        DestinationKey::from_url(&url)?;

        if !options.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&options.params);
        }

        let mut headers = HeaderMap::with_capacity(options.headers.len());
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::InvalidRequest(format!("invalid header name {name:?}")))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                Error::InvalidRequest(format!("invalid value for header {name}"))
            })?;
            headers.append(name, value);
        }

        let body = match (options.data, options.json) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidRequest(
                    "data and json cannot be combined".into(),
                ));
            }
            (Some(Data::Text(text)), None) => Body::from(text),
            (Some(Data::Bytes(bytes)), None) => Body::from(bytes),
            (Some(Data::Form(pairs)), None) => {
                let encoded = serde_urlencoded::to_string(&pairs)?;
                headers.entry(CONTENT_TYPE).or_insert(HeaderValue::from_static(
                    "application/x-www-form-urlencoded",
                ));
                Body::from(encoded)
            }
            (None, Some(value)) => {
                let encoded = serde_json::to_vec(&value)?;
                headers
                    .entry(CONTENT_TYPE)
                    .or_insert(HeaderValue::from_static("application/json"));
                Body::from(encoded)
            }
            (None, None) => Body::Empty,
        };

        Ok(Self {
            method,
            url,
            headers,
            body,
            timeout: options.timeout,
            auth: options.auth,
            verify: options.verify,
            allow_redirects: options.allow_redirects,
            max_redirects: options.max_redirects,
        })
    }

    /// Replace the body, for example with a stream.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL, query parameters included.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers, for [`crate::client::auth::Authenticate`] implementations.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Request body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Request deadline, if set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Pairs written either as a map or as a list of two-element lists.
fn pairs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, String)>, D::Error> {
    deserializer.deserialize_any(PairsVisitor)
}

struct PairsVisitor;

impl<'de> Visitor<'de> for PairsVisitor {
    type Value = Vec<(String, String)>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map or a list of pairs")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut pairs = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((name, Scalar(value))) = map.next_entry::<String, Scalar>()? {
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut pairs = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some((name, Scalar(value))) = seq.next_element::<(String, Scalar)>()? {
            pairs.push((name, value));
        }
        Ok(pairs)
    }
}

/// A string, number or boolean, kept as its text.
struct Scalar(String);

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ScalarVisitor;

        impl Visitor<'_> for ScalarVisitor {
            type Value = Scalar;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, number or boolean")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
                Ok(Scalar(v.to_owned()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
                Ok(Scalar(v.to_string()))
            }
        }

        deserializer.deserialize_any(ScalarVisitor)
    }
}
