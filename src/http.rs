//! Incremental HTTP/1.x message parser
//!
//! Feeds on successive byte chunks from either side of the proxy and tracks
//! message boundaries without owning the wire format: header bytes are kept
//! exactly as received (case, order, duplicates) so the message can be
//! forwarded bit-for-bit, and body bytes pass through as an opaque stream
//! while the parser only accounts for framing.
//!
//! Body framing follows the explicit headers only: `Transfer-Encoding:
//! chunked` wins over `Content-Length`, and a message with neither has no
//! body regardless of method. GNS3 clients send GET/DELETE requests with
//! JSON bodies, which this handles uniformly.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Maximum size of a single header line.
const MAX_HEADER_LINE: usize = 8 * 1024;
/// Maximum size of the whole head section.
const MAX_HEAD_SECTION: usize = 32 * 1024;
/// Maximum number of headers in a message.
const MAX_HEADERS: usize = 100;

const CRLF: &[u8] = b"\r\n";

/// Parse failures. All are fatal to the connection that produced the bytes.
#[derive(Debug, Error)]
pub enum HttpParseError {
    #[error("malformed start line or header: {0}")]
    MalformedStartLine(httparse::Error),
    #[error("header section too large")]
    HeaderTooLarge,
    #[error("bad chunk framing")]
    BadChunk,
    #[error("bad Content-Length value")]
    BadContentLength,
}

/// Which side of the exchange is being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Request,
    Response,
}

/// A single header, original bytes preserved.
#[derive(Debug, Clone)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

/// Body framing derived from the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head.
    None,
    /// Exactly this many bytes follow.
    ContentLength(u64),
    /// Chunked transfer coding.
    Chunked,
    /// Response body delimited by connection close.
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Body,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

/// Incremental request/response parser.
pub struct HttpParser {
    kind: ParserKind,
    state: State,
    /// Unconsumed input; bytes past the end of the current message stay
    /// here for the next one.
    buf: BytesMut,
    /// Raw head section, byte-for-byte as received.
    head: Vec<u8>,
    start_line: String,
    headers: Vec<Header>,
    method: String,
    target: String,
    version: String,
    status: u16,
    framing: BodyFraming,
    body_remaining: u64,
    chunk: ChunkState,
    /// Decoded body prefix, capped at `body_limit`.
    body: Vec<u8>,
    body_limit: usize,
    /// Wire bytes of the body awaiting forwarding, framing included.
    wire_out: BytesMut,
    /// Total body wire bytes seen.
    body_wire_len: u64,
}

impl HttpParser {
    pub fn new_request(body_limit: usize) -> Self {
        Self::new(ParserKind::Request, body_limit)
    }

    pub fn new_response(body_limit: usize) -> Self {
        Self::new(ParserKind::Response, body_limit)
    }

    fn new(kind: ParserKind, body_limit: usize) -> Self {
        Self {
            kind,
            state: State::Head,
            buf: BytesMut::new(),
            head: Vec::new(),
            start_line: String::new(),
            headers: Vec::new(),
            method: String::new(),
            target: String::new(),
            version: String::new(),
            status: 0,
            framing: BodyFraming::None,
            body_remaining: 0,
            chunk: ChunkState::Size,
            body: Vec::new(),
            body_limit,
            wire_out: BytesMut::new(),
            body_wire_len: 0,
        }
    }

    /// Reset for the next message on the same connection, keeping any
    /// already-buffered bytes (a pipelined follow-up request).
    pub fn reset(&mut self) {
        self.state = State::Head;
        self.head.clear();
        self.start_line.clear();
        self.headers.clear();
        self.method.clear();
        self.target.clear();
        self.version.clear();
        self.status = 0;
        self.framing = BodyFraming::None;
        self.body_remaining = 0;
        self.chunk = ChunkState::Size;
        self.body.clear();
        self.wire_out.clear();
        self.body_wire_len = 0;
    }

    /// Feed a chunk of input and advance as far as possible.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), HttpParseError> {
        self.buf.extend_from_slice(data);
        self.advance()
    }

    /// Advance on already-buffered bytes (used after `reset`).
    pub fn advance(&mut self) -> Result<(), HttpParseError> {
        loop {
            match self.state {
                State::Head => {
                    if !self.parse_head()? {
                        return Ok(());
                    }
                }
                State::Body => {
                    if !self.parse_body()? {
                        return Ok(());
                    }
                }
                State::Complete => return Ok(()),
            }
        }
    }

    pub fn head_complete(&self) -> bool {
        self.state != State::Head
    }

    pub fn complete(&self) -> bool {
        self.state == State::Complete
    }

    /// Whether buffered input is waiting to be parsed.
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Raw head section as received.
    pub fn head_bytes(&self) -> &[u8] {
        &self.head
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Request-target without query string or fragment.
    pub fn target_path(&self) -> &str {
        let end = self
            .target
            .find(['?', '#'])
            .unwrap_or(self.target.len());
        &self.target[..end]
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Decoded body prefix, capped at the configured limit.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_wire_len(&self) -> u64 {
        self.body_wire_len
    }

    /// Force body-less framing. Used for responses to HEAD requests, whose
    /// heads carry framing headers for a body that never arrives.
    pub fn expect_no_body(&mut self) {
        if self.state == State::Body {
            self.framing = BodyFraming::None;
            self.state = State::Complete;
        }
    }

    /// Take the body wire bytes accumulated since the last call.
    pub fn take_wire(&mut self) -> Bytes {
        self.body_wire_len += self.wire_out.len() as u64;
        self.wire_out.split().freeze()
    }

    /// Take raw input buffered past the end of the current message. Used to
    /// hand early tunnel bytes over after an upgrade handshake.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Adjust the decoded-body accumulation limit for the next message.
    pub fn set_body_limit(&mut self, limit: usize) {
        self.body_limit = limit;
    }

    /// Whether the message (or its absence of one) forbids connection reuse.
    pub fn wants_close(&self) -> bool {
        if self.framing == BodyFraming::UntilClose {
            return true;
        }
        match self.header("connection") {
            Some(value) => header_token_present(value, "close"),
            None => !self.version.eq_ignore_ascii_case("HTTP/1.1"),
        }
    }

    /// Re-render the head with the given header names removed and the given
    /// pairs appended. Everything else keeps its original bytes and order.
    pub fn build_head(&self, del_headers: &[&str], add_headers: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.head.len() + 128);
        out.extend_from_slice(self.start_line.as_bytes());
        out.extend_from_slice(CRLF);
        for header in &self.headers {
            if del_headers
                .iter()
                .any(|name| header.name.eq_ignore_ascii_case(name))
            {
                continue;
            }
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(CRLF);
        }
        for (name, value) in add_headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(CRLF);
        }
        out.extend_from_slice(CRLF);
        out
    }

    fn parse_head(&mut self) -> Result<bool, HttpParseError> {
        let head_len = {
            let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            match self.kind {
                ParserKind::Request => {
                    let mut req = httparse::Request::new(&mut header_storage);
                    match req.parse(&self.buf) {
                        Ok(httparse::Status::Complete(len)) => {
                            self.method = req.method.unwrap_or("").to_string();
                            let target = req.path.unwrap_or("");
                            // An empty request-target is treated as "/".
                            self.target = if target.is_empty() {
                                "/".to_string()
                            } else {
                                target.to_string()
                            };
                            self.version = match req.version {
                                Some(0) => "HTTP/1.0".to_string(),
                                _ => "HTTP/1.1".to_string(),
                            };
                            self.start_line =
                                format!("{} {} {}", self.method, self.target, self.version);
                            self.headers = req
                                .headers
                                .iter()
                                .map(|h| Header {
                                    name: h.name.to_string(),
                                    value: h.value.to_vec(),
                                })
                                .collect();
                            len
                        }
                        Ok(httparse::Status::Partial) => {
                            self.check_head_caps()?;
                            return Ok(false);
                        }
                        Err(e) => return Err(HttpParseError::MalformedStartLine(e)),
                    }
                }
                ParserKind::Response => {
                    let mut res = httparse::Response::new(&mut header_storage);
                    match res.parse(&self.buf) {
                        Ok(httparse::Status::Complete(len)) => {
                            self.status = res.code.unwrap_or(0);
                            self.version = match res.version {
                                Some(0) => "HTTP/1.0".to_string(),
                                _ => "HTTP/1.1".to_string(),
                            };
                            let reason = res.reason.unwrap_or("");
                            self.start_line = if reason.is_empty() {
                                format!("{} {}", self.version, self.status)
                            } else {
                                format!("{} {} {}", self.version, self.status, reason)
                            };
                            self.headers = res
                                .headers
                                .iter()
                                .map(|h| Header {
                                    name: h.name.to_string(),
                                    value: h.value.to_vec(),
                                })
                                .collect();
                            len
                        }
                        Ok(httparse::Status::Partial) => {
                            self.check_head_caps()?;
                            return Ok(false);
                        }
                        Err(e) => return Err(HttpParseError::MalformedStartLine(e)),
                    }
                }
            }
        };

        self.head = self.buf.split_to(head_len).to_vec();
        self.framing = self.derive_framing()?;
        self.state = match self.framing {
            BodyFraming::None => State::Complete,
            BodyFraming::ContentLength(0) => {
                self.framing = BodyFraming::None;
                State::Complete
            }
            BodyFraming::ContentLength(n) => {
                self.body_remaining = n;
                State::Body
            }
            BodyFraming::Chunked => {
                self.chunk = ChunkState::Size;
                State::Body
            }
            BodyFraming::UntilClose => State::Body,
        };
        Ok(true)
    }

    fn check_head_caps(&self) -> Result<(), HttpParseError> {
        if self.buf.len() > MAX_HEAD_SECTION {
            return Err(HttpParseError::HeaderTooLarge);
        }
        // The unterminated tail of the buffer is the line being received.
        let line_start = self
            .buf
            .windows(2)
            .rposition(|w| w == CRLF)
            .map(|pos| pos + 2)
            .unwrap_or(0);
        if self.buf.len() - line_start > MAX_HEADER_LINE {
            return Err(HttpParseError::HeaderTooLarge);
        }
        Ok(())
    }

    fn derive_framing(&self) -> Result<BodyFraming, HttpParseError> {
        // Chunked wins when both framing headers are present.
        if self.is_chunked() {
            return Ok(BodyFraming::Chunked);
        }
        if let Some(value) = self.header("content-length") {
            let text = std::str::from_utf8(value)
                .map_err(|_| HttpParseError::BadContentLength)?
                .trim();
            let length: u64 = text.parse().map_err(|_| HttpParseError::BadContentLength)?;
            return Ok(BodyFraming::ContentLength(length));
        }
        match self.kind {
            ParserKind::Request => Ok(BodyFraming::None),
            ParserKind::Response => {
                // 1xx, 204 and 304 never carry a body; anything else
                // without explicit framing runs until the peer closes.
                if self.status < 200 || self.status == 204 || self.status == 304 {
                    Ok(BodyFraming::None)
                } else {
                    Ok(BodyFraming::UntilClose)
                }
            }
        }
    }

    /// Whether the head declares chunked transfer coding.
    pub fn is_chunked(&self) -> bool {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
            .any(|h| header_token_present(&h.value, "chunked"))
    }

    fn parse_body(&mut self) -> Result<bool, HttpParseError> {
        match self.framing {
            BodyFraming::ContentLength(_) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let take = (self.body_remaining as usize).min(self.buf.len());
                let chunk = self.buf.split_to(take);
                self.accumulate(&chunk);
                self.wire_out.extend_from_slice(&chunk);
                self.body_remaining -= take as u64;
                if self.body_remaining == 0 {
                    self.state = State::Complete;
                }
                Ok(self.state == State::Complete)
            }
            BodyFraming::Chunked => self.parse_chunked(),
            BodyFraming::UntilClose => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let chunk = self.buf.split();
                self.accumulate(&chunk);
                self.wire_out.extend_from_slice(&chunk);
                Ok(false)
            }
            BodyFraming::None => {
                self.state = State::Complete;
                Ok(true)
            }
        }
    }

    fn parse_chunked(&mut self) -> Result<bool, HttpParseError> {
        loop {
            match self.chunk {
                ChunkState::Size => {
                    match httparse::parse_chunk_size(&self.buf) {
                        Ok(httparse::Status::Complete((consumed, size))) => {
                            let line = self.buf.split_to(consumed);
                            self.wire_out.extend_from_slice(&line);
                            if size == 0 {
                                self.chunk = ChunkState::Trailers;
                            } else {
                                self.chunk = ChunkState::Data(size);
                            }
                        }
                        Ok(httparse::Status::Partial) => {
                            if self.buf.len() > MAX_HEADER_LINE {
                                return Err(HttpParseError::BadChunk);
                            }
                            return Ok(false);
                        }
                        Err(_) => return Err(HttpParseError::BadChunk),
                    }
                }
                ChunkState::Data(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(false);
                    }
                    let take = (remaining as usize).min(self.buf.len());
                    let chunk = self.buf.split_to(take);
                    self.accumulate(&chunk);
                    self.wire_out.extend_from_slice(&chunk);
                    let left = remaining - take as u64;
                    self.chunk = if left == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data(left)
                    };
                }
                ChunkState::DataCrlf => {
                    if self.buf.len() < 2 {
                        return Ok(false);
                    }
                    if &self.buf[..2] != CRLF {
                        return Err(HttpParseError::BadChunk);
                    }
                    let crlf = self.buf.split_to(2);
                    self.wire_out.extend_from_slice(&crlf);
                    self.chunk = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    // Trailer lines until an empty line, all passed through.
                    match find_crlf(&self.buf) {
                        Some(pos) => {
                            let line = self.buf.split_to(pos + 2);
                            self.wire_out.extend_from_slice(&line);
                            if pos == 0 {
                                self.state = State::Complete;
                                return Ok(true);
                            }
                        }
                        None => {
                            if self.buf.len() > MAX_HEADER_LINE {
                                return Err(HttpParseError::BadChunk);
                            }
                            return Ok(false);
                        }
                    }
                }
            }
        }
    }

    fn accumulate(&mut self, data: &[u8]) {
        if self.body.len() < self.body_limit {
            let room = self.body_limit - self.body.len();
            self.body.extend_from_slice(&data[..data.len().min(room)]);
        }
    }
}

/// Whether a comma-separated header value contains the given token.
fn header_token_present(value: &[u8], token: &str) -> bool {
    std::str::from_utf8(value)
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut HttpParser, data: &[u8]) {
        parser.feed(data).unwrap();
    }

    #[test]
    fn parses_simple_get() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"GET /v2/version HTTP/1.1\r\nHost: x\r\nAuthorization: Basic abc\r\n\r\n",
        );
        assert!(p.complete());
        assert_eq!(p.method(), "GET");
        assert_eq!(p.target(), "/v2/version");
        assert_eq!(p.version(), "HTTP/1.1");
        assert_eq!(p.header("authorization").unwrap(), b"Basic abc");
        assert_eq!(p.header("AUTHORIZATION").unwrap(), b"Basic abc");
    }

    #[test]
    fn parses_across_partial_reads() {
        let raw = b"POST /v2/projects HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nbody";
        let mut p = HttpParser::new_request(1024);
        for byte in raw.iter() {
            p.feed(std::slice::from_ref(byte)).unwrap();
        }
        assert!(p.complete());
        assert_eq!(p.body(), b"body");
    }

    #[test]
    fn get_with_body_needs_explicit_framing() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"GET /v2/projects HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\n{}",
        );
        assert!(p.complete());
        assert_eq!(p.body(), b"{}");

        let mut p = HttpParser::new_request(1024);
        feed_all(&mut p, b"GET /v2/projects HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(p.complete());
        assert!(p.body().is_empty());
    }

    #[test]
    fn chunked_request_round_trip() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(p.head_complete());
        assert!(!p.complete());
        feed_all(&mut p, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        assert!(p.complete());
        assert_eq!(p.body(), b"Wikipedia");
        // Wire bytes keep the chunk framing intact.
        assert_eq!(p.take_wire().as_ref(), b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"POST /u HTTP/1.1\r\nContent-Length: 9999\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        );
        assert!(p.complete());
        assert_eq!(p.framing(), BodyFraming::Chunked);
    }

    #[test]
    fn header_case_and_order_preserved() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"GET / HTTP/1.1\r\nX-First: 1\r\nhOSt: x\r\nX-First: 2\r\n\r\n",
        );
        let names: Vec<&str> = p.headers().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["X-First", "hOSt", "X-First"]);
        let head = p.build_head(&[], &[]);
        assert!(std::str::from_utf8(&head).unwrap().contains("hOSt: x"));
    }

    #[test]
    fn build_head_removes_and_appends() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"GET /v2/version HTTP/1.1\r\nHost: old\r\nAuthorization: Basic abc\r\nAccept: */*\r\n\r\n",
        );
        let head = p.build_head(
            &["authorization", "host"],
            &[("Host", b"127.0.0.1:3080"), ("Authorization", b"Basic xyz")],
        );
        let text = std::str::from_utf8(&head).unwrap();
        assert!(!text.contains("old"));
        assert!(!text.contains("Basic abc"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.contains("Host: 127.0.0.1:3080\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn empty_target_becomes_slash() {
        // httparse rejects an actually-empty target, so the tolerance is
        // exercised through the stored value.
        let mut p = HttpParser::new_request(1024);
        feed_all(&mut p, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(p.target(), "/");
    }

    #[test]
    fn target_path_strips_query() {
        let mut p = HttpParser::new_request(1024);
        feed_all(&mut p, b"GET /v2/projects?limit=5 HTTP/1.1\r\n\r\n");
        assert_eq!(p.target_path(), "/v2/projects");
    }

    #[test]
    fn oversized_header_line_is_rejected() {
        let mut p = HttpParser::new_request(1024);
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_LINE + 1));
        let err = p.feed(&raw).unwrap_err();
        assert!(matches!(err, HttpParseError::HeaderTooLarge));
    }

    #[test]
    fn malformed_start_line_is_rejected() {
        let mut p = HttpParser::new_request(1024);
        assert!(p.feed(b"NOT A REQUEST\0\r\n\r\n").is_err());
    }

    #[test]
    fn bad_chunk_size_is_rejected() {
        let mut p = HttpParser::new_request(1024);
        feed_all(
            &mut p,
            b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let err = p.feed(b"zz\r\n").unwrap_err();
        assert!(matches!(err, HttpParseError::BadChunk));
    }

    #[test]
    fn response_without_framing_runs_until_close() {
        let mut p = HttpParser::new_response(0);
        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\nsome data");
        assert!(p.head_complete());
        assert!(!p.complete());
        assert_eq!(p.framing(), BodyFraming::UntilClose);
        assert!(p.wants_close());
    }

    #[test]
    fn response_204_has_no_body() {
        let mut p = HttpParser::new_response(0);
        feed_all(&mut p, b"HTTP/1.1 204 No Content\r\n\r\n");
        assert!(p.complete());
    }

    #[test]
    fn response_body_by_content_length() {
        let mut p = HttpParser::new_response(64);
        feed_all(
            &mut p,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhelloGET /next",
        );
        assert!(p.complete());
        assert_eq!(p.body(), b"hello");
        // Pipelined leftovers stay buffered.
        assert!(p.has_buffered());
    }

    #[test]
    fn keep_alive_defaults() {
        let mut p = HttpParser::new_request(0);
        feed_all(&mut p, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(!p.wants_close());

        let mut p = HttpParser::new_request(0);
        feed_all(&mut p, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert!(p.wants_close());

        let mut p = HttpParser::new_request(0);
        feed_all(&mut p, b"GET / HTTP/1.0\r\n\r\n");
        assert!(p.wants_close());
    }

    #[test]
    fn reset_carries_pipelined_request() {
        let mut p = HttpParser::new_request(64);
        feed_all(
            &mut p,
            b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nabGET /b HTTP/1.1\r\n\r\n",
        );
        assert!(p.complete());
        assert_eq!(p.body(), b"ab");
        p.reset();
        p.advance().unwrap();
        assert!(p.complete());
        assert_eq!(p.target(), "/b");
    }

    #[test]
    fn body_accumulator_is_bounded() {
        let mut p = HttpParser::new_request(4);
        feed_all(
            &mut p,
            b"POST /u HTTP/1.1\r\nContent-Length: 8\r\n\r\nabcdefgh",
        );
        assert!(p.complete());
        assert_eq!(p.body(), b"abcd");
        assert_eq!(p.take_wire().as_ref(), b"abcdefgh");
    }

    #[test]
    fn head_request_response_framing_override() {
        let mut p = HttpParser::new_response(0);
        feed_all(&mut p, b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");
        assert!(!p.complete());
        p.expect_no_body();
        assert!(p.complete());
    }
}
