//! Request bodies.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt as _};

/// The body of an outgoing request.
///
/// Bodies held in memory are sent with a `Content-Length`; streams are sent with chunked
/// transfer encoding.
#[derive(Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,

    /// A body held in memory.
    Full(Bytes),

    /// A body produced incrementally. Streams cannot be replayed, so a request carrying one is
    /// not re-sent when following a redirect that preserves the body.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// Wrap a stream of chunks.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body::Stream(stream.boxed())
    }

    /// Whether there is nothing to send.
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Full(bytes) => bytes.is_empty(),
            Body::Stream(_) => false,
        }
    }

    /// The body length, when known in advance.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Stream(_) => None,
        }
    }

    /// Copy the body, if it can be sent again.
    pub fn try_clone(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Full(bytes) => Some(Body::Full(bytes.clone())),
            Body::Stream(_) => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Body::Stream(_) => f.write_str("Body::Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Body::Full(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Full(value.into())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Full(value.into())
    }
}

impl From<&'static str> for Body {
    fn from(value: &'static str) -> Self {
        Body::Full(Bytes::from_static(value.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_are_not_replayable() {
        let body = Body::stream(futures::stream::iter(vec![Ok(Bytes::from_static(b"a"))]));
        assert!(body.try_clone().is_none());
        assert_eq!(body.len(), None);

        let body = Body::from("hello");
        assert_eq!(body.len(), Some(5));
        assert!(matches!(body.try_clone(), Some(Body::Full(b)) if b == "hello"));
    }
}
