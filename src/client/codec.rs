//! HTTP/1.1 wire codec.
//!
//! [`RequestEncoder`] turns a [`RequestHead`] and body into bytes. [`ResponseDecoder`] is a
//! resumable parser: it can be fed buffers of any size, consumes only what it can make sense
//! of, and defers on short input instead of failing. [`Http1Codec`] pairs the two so a
//! connection can be driven through [`tokio_util::codec::Framed`].
//!
//! Body framing follows RFC 9112: `Content-Length`, chunked transfer coding, or read-until-close.
//! Every numeric field on the wire (status code, content length, chunk size) is parsed with
//! explicit digit and overflow checks.

use std::collections::HashMap;
use std::io;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on the size of a response's status line and header block.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 64 * 1024;

/// Number of serialized header lines kept by an encoder.
const HEADER_CACHE_CAPACITY: usize = 128;

/// Longest chunk-size line (size, extensions and terminator) we are willing to buffer.
const MAX_CHUNK_LINE: usize = 4096;

/// A chunk size has at most 16 hex digits, which is exactly a `u64`.
const MAX_CHUNK_SIZE_DIGITS: usize = 16;

/// Malformed or non-conforming data on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The status line could not be split into version, code and reason.
    #[error("malformed status line")]
    StatusLine,

    /// The response declared an HTTP version other than 1.0 or 1.1.
    #[error("unsupported HTTP version")]
    Version,

    /// The status code is not three ASCII digits.
    #[error("invalid status code")]
    StatusCode,

    /// A header line is not a valid `name: value` pair.
    #[error("malformed header line")]
    HeaderLine,

    /// The status line and headers together exceed the configured cap.
    #[error("response header block exceeds {limit} bytes")]
    HeadersTooLarge {
        /// The configured cap, in bytes.
        limit: usize,
    },

    /// `Content-Length` is not a decimal number, overflows, or is repeated with different values.
    #[error("invalid content-length")]
    ContentLength,

    /// A chunk size is not a hexadecimal number or overflows.
    #[error("invalid chunk size")]
    ChunkSize,

    /// Chunk data is not followed by CRLF.
    #[error("malformed chunk framing")]
    ChunkFraming,

    /// The peer closed the connection before the message was complete.
    #[error("connection closed before message completed")]
    Incomplete,
}

/// Errors from reading or writing a framed HTTP connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer sent something we could not parse.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The underlying socket failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Request line and header block of an outgoing request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,

    /// Origin-form request target (path and query).
    pub target: String,

    /// Header fields, written in iteration order.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Create a request head with no headers.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// One unit written to a connection.
#[derive(Debug)]
pub enum Outgoing {
    /// A complete request with a body of known length.
    Full(RequestHead, Bytes),

    /// The head of a request whose body follows as chunks.
    StreamHead(RequestHead),

    /// One chunk of a streaming body.
    Chunk(Bytes),

    /// Terminates a streaming body.
    EndStream,
}

/// Serializes requests.
///
/// Header lines are formatted once and cached by `(name, value)`, so the session-wide
/// defaults sent on every request on a connection are not re-formatted each time.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    lines: HashMap<(HeaderName, HeaderValue), Bytes>,
}

impl RequestEncoder {
    /// Create an encoder with an empty header line cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a request with a body of known length.
    pub fn encode(&mut self, head: &RequestHead, body: &[u8], dst: &mut BytesMut) {
        self.encode_head(head, Some(body.len() as u64), dst);
        dst.extend_from_slice(body);
    }

    /// Encode the request line and header block.
    ///
    /// With `Some(length)` a `Content-Length` header is written (omitted for empty bodies on
    /// methods that do not carry one); with `None` the body is declared chunked. Any framing
    /// headers already present in `head` are replaced.
    pub fn encode_head(&mut self, head: &RequestHead, length: Option<u64>, dst: &mut BytesMut) {
        dst.reserve(head.target.len() + 16 + head.headers.len() * 32);
        dst.put_slice(head.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(head.target.as_bytes());
        dst.put_slice(b" HTTP/1.1\r\n");

        for (name, value) in head.headers.iter() {
            if name == header::CONTENT_LENGTH || name == header::TRANSFER_ENCODING {
                continue;
            }
            let line = self.line(name, value);
            dst.put_slice(&line);
        }

        match length {
            Some(0) if !carries_body(&head.method) => {}
            Some(length) => {
                dst.put_slice(b"content-length: ");
                dst.put_slice(length.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            None => dst.put_slice(b"transfer-encoding: chunked\r\n"),
        }
        dst.put_slice(b"\r\n");
    }

    /// Encode one chunk of a chunked body. Empty chunks are skipped, since a zero-size
    /// chunk terminates the body.
    pub fn encode_chunk(&mut self, data: &[u8], dst: &mut BytesMut) {
        if data.is_empty() {
            return;
        }
        dst.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
        dst.put_slice(data);
        dst.put_slice(b"\r\n");
    }

    /// Encode the terminating chunk of a chunked body.
    pub fn encode_end(&mut self, dst: &mut BytesMut) {
        dst.put_slice(b"0\r\n\r\n");
    }

    fn line(&mut self, name: &HeaderName, value: &HeaderValue) -> Bytes {
        let key = (name.clone(), value.clone());
        if let Some(line) = self.lines.get(&key) {
            return line.clone();
        }

        let mut line = BytesMut::with_capacity(name.as_str().len() + value.len() + 4);
        line.put_slice(name.as_str().as_bytes());
        line.put_slice(b": ");
        line.put_slice(value.as_bytes());
        line.put_slice(b"\r\n");
        let line = line.freeze();

        if self.lines.len() >= HEADER_CACHE_CAPACITY {
            self.lines.clear();
        }
        self.lines.insert(key, line.clone());
        line
    }
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Progress of a [`ResponseDecoder`] through one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Waiting for a complete status line.
    AwaitStatusLine,
    /// Status line read, reading header lines.
    AwaitHeaders,
    /// Header block complete, reading the body.
    AwaitBody,
    /// A full response is ready to be taken.
    Complete,
    /// The stream is unusable; every further call fails.
    Error,
}

/// A fully parsed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseParts {
    /// Protocol version from the status line.
    pub version: Version,
    /// Status code.
    pub status: StatusCode,
    /// Reason phrase, possibly empty.
    pub reason: String,
    /// Header fields.
    pub headers: HeaderMap,
    /// Body with transfer coding removed.
    pub body: Bytes,
    /// Whether the connection may carry another request afterwards.
    pub keep_alive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked(Chunk),
    UntilEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

enum Line {
    Complete(BytesMut),
    Partial,
    Overflow,
}

/// Splits one line off the front of `src`, without its terminator.
///
/// `budget` bounds the length of the line including the terminator.
fn split_line(src: &mut BytesMut, budget: usize) -> Line {
    match src.iter().position(|&b| b == b'\n') {
        Some(idx) if idx + 1 > budget => Line::Overflow,
        Some(idx) => {
            let mut line = src.split_to(idx + 1);
            line.truncate(idx);
            if line.last() == Some(&b'\r') {
                line.truncate(idx - 1);
            }
            Line::Complete(line)
        }
        None if !src.is_empty() && src.len() >= budget => Line::Overflow,
        None => Line::Partial,
    }
}

/// Incremental response parser.
#[derive(Debug)]
pub struct ResponseDecoder {
    state: ParseState,
    error: Option<ProtocolError>,
    max_header_size: usize,
    header_bytes: usize,
    head_only: bool,
    version: Version,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    framing: Framing,
    body: BytesMut,
    keep_alive: bool,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_SIZE)
    }
}

impl ResponseDecoder {
    /// Create a decoder which rejects header blocks larger than `max_header_size` bytes.
    pub fn new(max_header_size: usize) -> Self {
        Self {
            state: ParseState::AwaitStatusLine,
            error: None,
            max_header_size,
            header_bytes: 0,
            head_only: false,
            version: Version::HTTP_11,
            status: StatusCode::OK,
            reason: String::new(),
            headers: HeaderMap::new(),
            framing: Framing::Empty,
            body: BytesMut::new(),
            keep_alive: true,
        }
    }

    /// Current parse state.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Prepare for the response to a request with the given method.
    ///
    /// Responses to `HEAD` never carry a body, whatever their framing headers say.
    pub fn expect_response(&mut self, method: &Method) {
        self.head_only = *method == Method::HEAD;
    }

    /// Consume as much of `src` as possible.
    ///
    /// Returns the response once it is complete; `Ok(None)` means more input is needed.
    /// After an error the decoder stays in [`ParseState::Error`].
    pub fn feed(&mut self, src: &mut BytesMut) -> Result<Option<ResponseParts>, ProtocolError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        match self.advance(src) {
            Ok(parts) => Ok(parts),
            Err(error) => {
                tracing::trace!(%error, "response parse error");
                self.state = ParseState::Error;
                self.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Signal that the peer closed the connection after `src` was received.
    ///
    /// A body delimited by connection close completes here. Returns `Ok(None)` if the close
    /// happened cleanly between responses.
    pub fn finish(&mut self, src: &mut BytesMut) -> Result<Option<ResponseParts>, ProtocolError> {
        if let Some(parts) = self.feed(src)? {
            return Ok(Some(parts));
        }

        match (self.state, self.framing) {
            (ParseState::AwaitStatusLine, _) if src.is_empty() => Ok(None),
            (ParseState::AwaitBody, Framing::UntilEof) => {
                self.state = ParseState::Complete;
                Ok(Some(self.take_response()))
            }
            _ => {
                self.state = ParseState::Error;
                self.error = Some(ProtocolError::Incomplete);
                Err(ProtocolError::Incomplete)
            }
        }
    }

    fn advance(&mut self, src: &mut BytesMut) -> Result<Option<ResponseParts>, ProtocolError> {
        loop {
            match self.state {
                ParseState::AwaitStatusLine => {
                    let Some(line) = self.head_line(src)? else {
                        return Ok(None);
                    };
                    // Tolerate stray CRLF between messages.
                    if line.is_empty() {
                        continue;
                    }
                    self.parse_status_line(&line)?;
                    self.state = ParseState::AwaitHeaders;
                }
                ParseState::AwaitHeaders => {
                    let Some(line) = self.head_line(src)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.end_of_head()?;
                    } else {
                        self.parse_header(&line)?;
                    }
                }
                ParseState::AwaitBody => {
                    if !self.read_body(src)? {
                        return Ok(None);
                    }
                    self.state = ParseState::Complete;
                }
                ParseState::Complete => return Ok(Some(self.take_response())),
                ParseState::Error => {
                    return Err(self.error.clone().unwrap_or(ProtocolError::Incomplete));
                }
            }
        }
    }

    fn head_line(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolError> {
        let budget = self.max_header_size.saturating_sub(self.header_bytes);
        let before = src.len();
        match split_line(src, budget) {
            Line::Complete(line) => {
                self.header_bytes += before - src.len();
                Ok(Some(line))
            }
            Line::Partial => Ok(None),
            Line::Overflow => Err(ProtocolError::HeadersTooLarge {
                limit: self.max_header_size,
            }),
        }
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<(), ProtocolError> {
        let space = line
            .iter()
            .position(|&b| b == b' ')
            .ok_or(ProtocolError::StatusLine)?;
        let (version, rest) = (&line[..space], &line[space + 1..]);

        self.version = match version {
            b"HTTP/1.1" => Version::HTTP_11,
            b"HTTP/1.0" => Version::HTTP_10,
            v if v.starts_with(b"HTTP/") => return Err(ProtocolError::Version),
            _ => return Err(ProtocolError::StatusLine),
        };

        if rest.len() < 3 || (rest.len() > 3 && rest[3] != b' ') {
            return Err(ProtocolError::StatusCode);
        }
        self.status = parse_status(&rest[..3]).ok_or(ProtocolError::StatusCode)?;
        self.reason = rest
            .get(4..)
            .map(|reason| latin1(trim(reason)))
            .unwrap_or_default();
        Ok(())
    }

    fn parse_header(&mut self, line: &[u8]) -> Result<(), ProtocolError> {
        // Obsolete line folding is not accepted.
        if matches!(line.first(), Some(b' ' | b'\t')) {
            return Err(ProtocolError::HeaderLine);
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ProtocolError::HeaderLine)?;
        let name =
            HeaderName::from_bytes(&line[..colon]).map_err(|_| ProtocolError::HeaderLine)?;
        let value = HeaderValue::from_bytes(trim(&line[colon + 1..]))
            .map_err(|_| ProtocolError::HeaderLine)?;
        self.headers.append(name, value);
        Ok(())
    }

    fn end_of_head(&mut self) -> Result<(), ProtocolError> {
        if self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS {
            tracing::trace!(status = %self.status, "skipping interim response");
            self.headers.clear();
            self.header_bytes = 0;
            self.state = ParseState::AwaitStatusLine;
            return Ok(());
        }

        self.keep_alive = keep_alive(self.version, &self.headers);
        self.framing = self.framing()?;
        self.state = match self.framing {
            Framing::Empty | Framing::Length(0) => ParseState::Complete,
            _ => ParseState::AwaitBody,
        };
        Ok(())
    }

    fn framing(&mut self) -> Result<Framing, ProtocolError> {
        if self.status == StatusCode::SWITCHING_PROTOCOLS {
            self.keep_alive = false;
            return Ok(Framing::Empty);
        }

        if self.head_only
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(Framing::Empty);
        }

        if let Some(coding) = self.headers.get_all(header::TRANSFER_ENCODING).iter().last() {
            let last = coding
                .as_bytes()
                .rsplit(|&b| b == b',')
                .next()
                .map(trim)
                .unwrap_or_default();
            if self.headers.contains_key(header::CONTENT_LENGTH) {
                self.keep_alive = false;
            }
            if last.eq_ignore_ascii_case(b"chunked") {
                return Ok(Framing::Chunked(Chunk::Size));
            }
            self.keep_alive = false;
            return Ok(Framing::UntilEof);
        }

        match content_length(&self.headers)? {
            Some(length) => Ok(Framing::Length(length)),
            None => {
                self.keep_alive = false;
                Ok(Framing::UntilEof)
            }
        }
    }

    /// Returns `true` once the body is complete.
    fn read_body(&mut self, src: &mut BytesMut) -> Result<bool, ProtocolError> {
        loop {
            match self.framing {
                Framing::Empty => return Ok(true),
                Framing::Length(remaining) => {
                    let n = take(remaining, src.len());
                    self.body.extend_from_slice(&src.split_to(n));
                    let remaining = remaining - n as u64;
                    self.framing = Framing::Length(remaining);
                    return Ok(remaining == 0);
                }
                Framing::UntilEof => {
                    self.body.extend_from_slice(&src.split());
                    return Ok(false);
                }
                Framing::Chunked(Chunk::Size) => {
                    let line = match split_line(src, MAX_CHUNK_LINE) {
                        Line::Complete(line) => line,
                        Line::Partial => return Ok(false),
                        Line::Overflow => return Err(ProtocolError::ChunkSize),
                    };
                    let digits = line[..]
                        .split(|&b| b == b';')
                        .next()
                        .map(trim)
                        .unwrap_or_default();
                    let size = parse_hex(digits).ok_or(ProtocolError::ChunkSize)?;
                    self.framing = if size == 0 {
                        Framing::Chunked(Chunk::Trailers)
                    } else {
                        Framing::Chunked(Chunk::Data(size))
                    };
                }
                Framing::Chunked(Chunk::Data(remaining)) => {
                    if src.is_empty() {
                        return Ok(false);
                    }
                    let n = take(remaining, src.len());
                    self.body.extend_from_slice(&src.split_to(n));
                    let remaining = remaining - n as u64;
                    self.framing = if remaining == 0 {
                        Framing::Chunked(Chunk::DataEnd)
                    } else {
                        Framing::Chunked(Chunk::Data(remaining))
                    };
                }
                Framing::Chunked(Chunk::DataEnd) => {
                    if src.starts_with(b"\r\n") {
                        src.advance(2);
                    } else if src.is_empty() || src[..] == b"\r"[..] {
                        return Ok(false);
                    } else {
                        return Err(ProtocolError::ChunkFraming);
                    }
                    self.framing = Framing::Chunked(Chunk::Size);
                }
                Framing::Chunked(Chunk::Trailers) => {
                    // Trailer fields count against the header cap and are otherwise ignored.
                    let Some(line) = self.head_line(src)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        return Ok(true);
                    }
                }
            }
        }
    }

    fn take_response(&mut self) -> ResponseParts {
        let parts = ResponseParts {
            version: self.version,
            status: self.status,
            reason: std::mem::take(&mut self.reason),
            headers: std::mem::take(&mut self.headers),
            body: self.body.split().freeze(),
            keep_alive: self.keep_alive,
        };

        self.state = ParseState::AwaitStatusLine;
        self.header_bytes = 0;
        self.head_only = false;
        self.framing = Framing::Empty;
        self.keep_alive = true;
        parts
    }
}

/// Number of bytes to take when `remaining` are wanted and `available` are buffered.
fn take(remaining: u64, available: usize) -> usize {
    usize::try_from(remaining).map_or(available, |remaining| remaining.min(available))
}

fn keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let mut close = false;
    let mut keep = false;
    for value in headers.get_all(header::CONNECTION) {
        for token in value.as_bytes().split(|&b| b == b',').map(trim) {
            if token.eq_ignore_ascii_case(b"close") {
                close = true;
            } else if token.eq_ignore_ascii_case(b"keep-alive") {
                keep = true;
            }
        }
    }

    if close {
        false
    } else if version == Version::HTTP_10 {
        keep
    } else {
        true
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ProtocolError> {
    let mut length = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        for item in value.as_bytes().split(|&b| b == b',').map(trim) {
            let parsed = parse_decimal(item).ok_or(ProtocolError::ContentLength)?;
            match length {
                Some(previous) if previous != parsed => return Err(ProtocolError::ContentLength),
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

fn parse_status(digits: &[u8]) -> Option<StatusCode> {
    let code = parse_decimal(digits)?;
    StatusCode::from_u16(u16::try_from(code).ok()?).ok()
}

fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &b| {
        if !b.is_ascii_digit() {
            return None;
        }
        acc.checked_mul(10)?.checked_add(u64::from(b - b'0'))
    })
}

fn parse_hex(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > MAX_CHUNK_SIZE_DIGITS {
        return None;
    }
    digits.iter().try_fold(0u64, |acc, &b| {
        let digit = char::from(b).to_digit(16)?;
        acc.checked_mul(16)?.checked_add(u64::from(digit))
    })
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !matches!(b, b' ' | b'\t'))
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, b' ' | b'\t'))
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Client-side HTTP/1.1 codec for use with [`tokio_util::codec::Framed`].
#[derive(Debug, Default)]
pub struct Http1Codec {
    encoder: RequestEncoder,
    decoder: ResponseDecoder,
}

impl Http1Codec {
    /// Create a codec with the given header block cap.
    pub fn new(max_header_size: usize) -> Self {
        Self {
            encoder: RequestEncoder::new(),
            decoder: ResponseDecoder::new(max_header_size),
        }
    }

    /// The response decoder.
    pub fn decoder(&self) -> &ResponseDecoder {
        &self.decoder
    }
}

impl Encoder<Outgoing> for Http1Codec {
    type Error = CodecError;

    fn encode(&mut self, item: Outgoing, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outgoing::Full(head, body) => {
                self.decoder.expect_response(&head.method);
                self.encoder.encode(&head, &body, dst);
            }
            Outgoing::StreamHead(head) => {
                self.decoder.expect_response(&head.method);
                self.encoder.encode_head(&head, None, dst);
            }
            Outgoing::Chunk(data) => self.encoder.encode_chunk(&data, dst),
            Outgoing::EndStream => self.encoder.encode_end(dst),
        }
        Ok(())
    }
}

impl Decoder for Http1Codec {
    type Item = ResponseParts;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decoder.feed(src)?)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decoder.finish(src)?)
    }
}
