//! Incremental HTTP/1.x message parser.
//!
//! One state machine is reused for requests and responses, selected at
//! construction. The caller feeds buffer slices as they arrive; the
//! parser consumes bytes from the front and reports whether a full
//! message has been accepted or more bytes are needed. Any bytes left
//! in the caller's buffer after an accept belong to the next pipelined
//! message.
//!
//! Line endings are CRLF or a bare LF, uniformly (a CR not followed by
//! LF rejects). Folded header lines (continuations starting with SP or
//! HT) are appended to the previous value with a single space. Chunk
//! extensions are ignored through the end of the size line, and any
//! trailers after the last chunk are skipped.

use std::mem;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use tracing::warn;

use crate::error::Parse;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::http::types::{Params, CONTENT_TYPE_URLENCODED};
use crate::http::TransferEncoding;
use crate::{Error, Result};

/// Maximum length of a single header line (name plus value).
pub const HEADER_LINE_MAX: usize = 8192;
/// Maximum size of the whole header section.
pub const HEADERS_SECTION_MAX: usize = 64 * 1024;
/// Maximum length of a request method token.
pub const METHOD_MAX: usize = 1024;
/// Maximum length of a resource path.
pub const RESOURCE_MAX: usize = 256 * 1024;
/// Maximum length of a query string.
pub const QUERY_STRING_MAX: usize = 1024 * 1024;
/// Maximum length of a response status message.
pub const STATUS_MESSAGE_MAX: usize = 1024;
/// Default maximum size of a message body.
pub const DEFAULT_CONTENT_MAX: usize = 1024 * 1024;

const QUERY_NAME_MAX: usize = 1024;
const QUERY_VALUE_MAX: usize = 1024 * 1024;
const COOKIE_NAME_MAX: usize = 1024;
const COOKIE_VALUE_MAX: usize = 1024 * 1024;
const CHUNK_SIZE_DIGITS_MAX: usize = 16;

/// Progress reported by [`Parser::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A complete message has been parsed; unconsumed bytes remain in
    /// the caller's buffer.
    Accept,
    /// More bytes are needed.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeadState {
    Start,
    Method,
    UriStem,
    UriQuery,
    VersionH,
    VersionT1,
    VersionT2,
    VersionP,
    VersionSlash,
    VersionMajorStart,
    VersionMajor,
    VersionMinorStart,
    VersionMinor,
    StatusCodeStart,
    StatusCode,
    StatusMessage,
    ExpectingLf,
    HeaderLineStart,
    HeaderFold,
    HeaderName,
    SpaceBeforeHeaderValue,
    HeaderValue,
    ExpectingFinalLf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    SizeStart,
    Size,
    SizeWs,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    FinalLf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Head,
    Fixed,
    Chunked(ChunkState),
    ToEof,
    Done,
}

enum HeadStep {
    InHead,
    Complete,
}

/// Incremental parser for one HTTP request or response.
///
/// Call [`parse`](Parser::parse) with successive buffers until it
/// returns [`ParseStatus::Accept`], then seal the result with
/// [`finish_request`](Parser::finish_request) or
/// [`finish_response`](Parser::finish_response). [`reset`](Parser::reset)
/// re-arms the parser for the next message on the same stream.
#[derive(Debug)]
pub struct Parser {
    kind: MessageKind,
    head_state: HeadState,
    body_state: BodyState,

    method: String,
    resource: Vec<u8>,
    query_string: Vec<u8>,
    version_major: u16,
    version_minor: u16,
    status_code: u16,
    status_message: Vec<u8>,

    pending_name: Vec<u8>,
    pending_value: Vec<u8>,
    have_pending: bool,
    headers: HeaderMap,

    content: BytesMut,
    content_remaining: usize,
    chunk_size_str: String,
    chunked: bool,
    eof_terminated: bool,

    head_len: usize,
    line_len: usize,
    trailer_len: usize,

    bytes_last_read: usize,
    bytes_total_read: u64,
    max_content_length: usize,

    /// Method of the request this response answers; influences the
    /// implied-empty body rules.
    req_method: Option<Method>,
}

impl Parser {
    /// Creates a parser for inbound requests.
    pub fn new_request() -> Parser {
        Parser::new(MessageKind::Request)
    }

    /// Creates a parser for inbound responses.
    pub fn new_response() -> Parser {
        Parser::new(MessageKind::Response)
    }

    fn new(kind: MessageKind) -> Parser {
        Parser {
            kind,
            head_state: HeadState::Start,
            body_state: BodyState::Head,
            method: String::new(),
            resource: Vec::new(),
            query_string: Vec::new(),
            version_major: 0,
            version_minor: 0,
            status_code: 0,
            status_message: Vec::new(),
            pending_name: Vec::new(),
            pending_value: Vec::new(),
            have_pending: false,
            headers: HeaderMap::new(),
            content: BytesMut::new(),
            content_remaining: 0,
            chunk_size_str: String::new(),
            chunked: false,
            eof_terminated: false,
            head_len: 0,
            line_len: 0,
            trailer_len: 0,
            bytes_last_read: 0,
            bytes_total_read: 0,
            max_content_length: DEFAULT_CONTENT_MAX,
            req_method: None,
        }
    }

    /// Re-arms the parser for the next message, keeping configuration
    /// and the total byte counter.
    pub fn reset(&mut self) {
        let max = self.max_content_length;
        let total = self.bytes_total_read;
        let req_method = self.req_method.take();
        *self = Parser::new(self.kind);
        self.max_content_length = max;
        self.bytes_total_read = total;
        self.req_method = req_method;
    }

    /// For response parsers: records the method of the request this
    /// response answers (a reply to HEAD never carries a body).
    pub fn set_request_method(&mut self, method: &Method) {
        self.req_method = Some(method.clone());
    }

    /// Caps the size of an accepted message body.
    pub fn set_max_content_length(&mut self, max: usize) {
        self.max_content_length = max;
    }

    /// Bytes consumed by the last `parse` call.
    pub fn bytes_last_read(&self) -> usize {
        self.bytes_last_read
    }

    /// Total bytes consumed since construction (or the last explicit
    /// counter reset).
    pub fn total_bytes_read(&self) -> u64 {
        self.bytes_total_read
    }

    /// Resets the total byte counter (used between paired exchanges).
    pub fn reset_byte_counter(&mut self) {
        self.bytes_total_read = 0;
    }

    /// True once a whole message has been accepted.
    pub fn is_done(&self) -> bool {
        matches!(self.body_state, BodyState::Done)
    }

    /// True when the body was delimited by the peer closing the stream.
    pub fn eof_terminated(&self) -> bool {
        self.eof_terminated
    }

    /// Consumes bytes from the front of `buf`, advancing the message
    /// state machine.
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<ParseStatus> {
        if self.is_done() {
            return Ok(ParseStatus::Accept);
        }
        let (consumed, result) = self.parse_inner(&buf[..]);
        self.bytes_last_read = consumed;
        self.bytes_total_read += consumed as u64;
        buf.advance(consumed);
        result
    }

    /// Signals end-of-stream. A body delimited by connection close is
    /// accepted; anything else mid-message is an incomplete message.
    pub fn finish(&mut self) -> Result<ParseStatus> {
        match self.body_state {
            BodyState::Done => Ok(ParseStatus::Accept),
            BodyState::ToEof => {
                self.body_state = BodyState::Done;
                self.eof_terminated = true;
                Ok(ParseStatus::Accept)
            }
            _ => Err(Error::new_incomplete()),
        }
    }

    fn parse_inner(&mut self, data: &[u8]) -> (usize, Result<ParseStatus>) {
        let mut i = 0;
        while i < data.len() {
            match self.body_state {
                BodyState::Head => {
                    // The section cap covers header lines; the first
                    // line has its own per-component limits.
                    if self.in_header_section() {
                        self.head_len += 1;
                        if self.head_len > HEADERS_SECTION_MAX {
                            return (i, Err(Error::new_parse(Parse::TooLarge)));
                        }
                    }
                    let c = data[i];
                    i += 1;
                    match self.step_head(c) {
                        Ok(HeadStep::InHead) => {}
                        Ok(HeadStep::Complete) => {
                            if let Err(e) = self.decide_body() {
                                return (i, Err(e));
                            }
                            if matches!(self.body_state, BodyState::Done) {
                                return (i, Ok(ParseStatus::Accept));
                            }
                        }
                        Err(e) => return (i, Err(e)),
                    }
                }
                BodyState::Fixed => {
                    let take = self.content_remaining.min(data.len() - i);
                    self.content.extend_from_slice(&data[i..i + take]);
                    self.content_remaining -= take;
                    i += take;
                    if self.content_remaining == 0 {
                        self.body_state = BodyState::Done;
                        return (i, Ok(ParseStatus::Accept));
                    }
                }
                BodyState::Chunked(ChunkState::Data) => {
                    let take = self.content_remaining.min(data.len() - i);
                    if self.content.len() + take > self.max_content_length {
                        return (i, Err(Error::new_parse(Parse::TooLarge)));
                    }
                    self.content.extend_from_slice(&data[i..i + take]);
                    self.content_remaining -= take;
                    i += take;
                    if self.content_remaining == 0 {
                        self.body_state = BodyState::Chunked(ChunkState::DataCr);
                    }
                }
                BodyState::Chunked(state) => {
                    let c = data[i];
                    i += 1;
                    match self.step_chunk(state, c) {
                        Ok(true) => {
                            self.body_state = BodyState::Done;
                            return (i, Ok(ParseStatus::Accept));
                        }
                        Ok(false) => {}
                        Err(e) => return (i, Err(e)),
                    }
                }
                BodyState::ToEof => {
                    let take = data.len() - i;
                    if self.content.len() + take > self.max_content_length {
                        return (i, Err(Error::new_parse(Parse::TooLarge)));
                    }
                    self.content.extend_from_slice(&data[i..]);
                    i = data.len();
                }
                BodyState::Done => {
                    return (i, Ok(ParseStatus::Accept));
                }
            }
        }
        (i, Ok(ParseStatus::Continue))
    }

    fn step_head(&mut self, c: u8) -> Result<HeadStep> {
        use self::HeadState::*;

        match self.head_state {
            Start => match self.kind {
                // Ignore stray whitespace before the first line.
                MessageKind::Request => {
                    if c != b' ' && c != b'\r' && c != b'\n' {
                        if !is_token_char(c) {
                            return Err(Error::new_parse(Parse::FirstLine));
                        }
                        self.method.push(c as char);
                        self.head_state = Method;
                    }
                }
                MessageKind::Response => {
                    if c != b' ' && c != b'\r' && c != b'\n' {
                        if c != b'H' {
                            return Err(Error::new_parse(Parse::FirstLine));
                        }
                        self.head_state = VersionT1;
                    }
                }
            },
            Method => {
                if c == b' ' {
                    self.head_state = UriStem;
                } else if !is_token_char(c) {
                    return Err(Error::new_parse(Parse::Method));
                } else if self.method.len() >= METHOD_MAX {
                    return Err(Error::new_parse(Parse::TooLarge));
                } else {
                    self.method.push(c as char);
                }
            }
            UriStem => {
                if c == b' ' {
                    self.head_state = VersionH;
                } else if c == b'?' {
                    self.head_state = UriQuery;
                } else if is_control(c) {
                    return Err(Error::new_parse(Parse::Uri));
                } else if self.resource.len() >= RESOURCE_MAX {
                    return Err(Error::new_parse(Parse::TooLarge));
                } else {
                    self.resource.push(c);
                }
            }
            UriQuery => {
                if c == b' ' {
                    self.head_state = VersionH;
                } else if is_control(c) {
                    return Err(Error::new_parse(Parse::Uri));
                } else if self.query_string.len() >= QUERY_STRING_MAX {
                    return Err(Error::new_parse(Parse::TooLarge));
                } else {
                    self.query_string.push(c);
                }
            }
            VersionH => {
                if c != b'H' {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.head_state = VersionT1;
            }
            VersionT1 => {
                if c != b'T' {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.head_state = VersionT2;
            }
            VersionT2 => {
                if c != b'T' {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.head_state = VersionP;
            }
            VersionP => {
                if c != b'P' {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.head_state = VersionSlash;
            }
            VersionSlash => {
                if c != b'/' {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.head_state = VersionMajorStart;
            }
            VersionMajorStart => {
                if !c.is_ascii_digit() {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.version_major = (c - b'0') as u16;
                self.head_state = VersionMajor;
            }
            VersionMajor => {
                if c == b'.' {
                    self.head_state = VersionMinorStart;
                } else if c.is_ascii_digit() {
                    self.version_major = self.version_major.saturating_mul(10) + (c - b'0') as u16;
                } else {
                    return Err(Error::new_parse(Parse::Version));
                }
            }
            VersionMinorStart => {
                if !c.is_ascii_digit() {
                    return Err(Error::new_parse(Parse::Version));
                }
                self.version_minor = (c - b'0') as u16;
                self.head_state = VersionMinor;
            }
            VersionMinor => match c {
                b' ' => {
                    // Only a response carries a status after the version.
                    if self.kind == MessageKind::Request {
                        return Err(Error::new_parse(Parse::FirstLine));
                    }
                    self.head_state = StatusCodeStart;
                }
                b'\r' => {
                    if self.kind == MessageKind::Response {
                        return Err(Error::new_parse(Parse::FirstLine));
                    }
                    self.head_state = ExpectingLf;
                }
                b'\n' => {
                    if self.kind == MessageKind::Response {
                        return Err(Error::new_parse(Parse::FirstLine));
                    }
                    self.start_header_line();
                }
                _ if c.is_ascii_digit() => {
                    self.version_minor = self.version_minor.saturating_mul(10) + (c - b'0') as u16;
                }
                _ => return Err(Error::new_parse(Parse::Version)),
            },
            StatusCodeStart => {
                if !c.is_ascii_digit() {
                    return Err(Error::new_parse(Parse::Status));
                }
                self.status_code = (c - b'0') as u16;
                self.head_state = StatusCode;
            }
            StatusCode => match c {
                b' ' => self.head_state = StatusMessage,
                b'\r' => self.head_state = ExpectingLf,
                b'\n' => self.start_header_line(),
                _ if c.is_ascii_digit() => {
                    self.status_code = self.status_code.saturating_mul(10) + (c - b'0') as u16;
                }
                _ => return Err(Error::new_parse(Parse::Status)),
            },
            StatusMessage => {
                if c == b'\r' {
                    self.head_state = ExpectingLf;
                } else if c == b'\n' {
                    self.start_header_line();
                } else if is_control(c) {
                    return Err(Error::new_parse(Parse::Status));
                } else if self.status_message.len() >= STATUS_MESSAGE_MAX {
                    return Err(Error::new_parse(Parse::TooLarge));
                } else {
                    self.status_message.push(c);
                }
            }
            ExpectingLf => {
                if c != b'\n' {
                    return Err(Error::new_parse(Parse::Header));
                }
                self.start_header_line();
            }
            HeaderLineStart => match c {
                b'\r' => self.head_state = ExpectingFinalLf,
                b'\n' => return self.complete_head(),
                b' ' | b'\t' => {
                    // Folded continuation of the previous header value.
                    if !self.have_pending {
                        return Err(Error::new_parse(Parse::Header));
                    }
                    self.head_state = HeaderFold;
                }
                _ => {
                    if !is_token_char(c) {
                        return Err(Error::new_parse(Parse::Header));
                    }
                    self.commit_pending()?;
                    self.pending_name.push(c);
                    self.have_pending = true;
                    self.head_state = HeaderName;
                }
            },
            HeaderFold => match c {
                b' ' | b'\t' => {}
                b'\r' => self.head_state = ExpectingLf,
                b'\n' => self.start_header_line(),
                _ => {
                    if is_control(c) {
                        return Err(Error::new_parse(Parse::Header));
                    }
                    self.pending_value.push(b' ');
                    self.pending_value.push(c);
                    self.head_state = HeaderValue;
                }
            },
            HeaderName => {
                self.bump_line()?;
                if c == b':' {
                    self.head_state = SpaceBeforeHeaderValue;
                } else if !is_token_char(c) {
                    return Err(Error::new_parse(Parse::Header));
                } else {
                    self.pending_name.push(c);
                }
            }
            SpaceBeforeHeaderValue => {
                self.bump_line()?;
                match c {
                    b' ' => self.head_state = HeaderValue,
                    b'\r' => self.head_state = ExpectingLf,
                    b'\n' => self.start_header_line(),
                    _ => {
                        if is_control(c) {
                            return Err(Error::new_parse(Parse::Header));
                        }
                        self.pending_value.push(c);
                        self.head_state = HeaderValue;
                    }
                }
            }
            HeaderValue => {
                self.bump_line()?;
                match c {
                    b'\r' => self.head_state = ExpectingLf,
                    b'\n' => self.start_header_line(),
                    _ => {
                        if is_control(c) {
                            return Err(Error::new_parse(Parse::Header));
                        }
                        self.pending_value.push(c);
                    }
                }
            }
            ExpectingFinalLf => {
                if c != b'\n' {
                    return Err(Error::new_parse(Parse::Header));
                }
                return self.complete_head();
            }
        }
        Ok(HeadStep::InHead)
    }

    fn in_header_section(&self) -> bool {
        matches!(
            self.head_state,
            HeadState::HeaderLineStart
                | HeadState::HeaderFold
                | HeadState::HeaderName
                | HeadState::SpaceBeforeHeaderValue
                | HeadState::HeaderValue
                | HeadState::ExpectingFinalLf
        )
    }

    fn start_header_line(&mut self) {
        self.line_len = 0;
        self.head_state = HeadState::HeaderLineStart;
    }

    fn bump_line(&mut self) -> Result<()> {
        self.line_len += 1;
        if self.line_len > HEADER_LINE_MAX {
            return Err(Error::new_parse(Parse::HeaderTooLarge));
        }
        Ok(())
    }

    fn complete_head(&mut self) -> Result<HeadStep> {
        self.commit_pending()?;
        Ok(HeadStep::Complete)
    }

    fn commit_pending(&mut self) -> Result<()> {
        if !self.have_pending {
            return Ok(());
        }
        let name = HeaderName::from_bytes(&self.pending_name)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        let value = HeaderValue::from_bytes(&self.pending_value)
            .map_err(|_| Error::new_parse(Parse::Header))?;
        self.headers.append(name, value);
        self.pending_name.clear();
        self.pending_value.clear();
        self.have_pending = false;
        Ok(())
    }

    fn decide_body(&mut self) -> Result<()> {
        if self.kind == MessageKind::Response && self.implied_empty() {
            self.body_state = BodyState::Done;
            return Ok(());
        }
        if self.is_chunked() {
            self.chunked = true;
            self.body_state = BodyState::Chunked(ChunkState::SizeStart);
            return Ok(());
        }
        if let Some(len) = self.content_length()? {
            if len > self.max_content_length {
                return Err(Error::new_parse(Parse::TooLarge));
            }
            if len == 0 {
                self.body_state = BodyState::Done;
            } else {
                self.content.reserve(len);
                self.content_remaining = len;
                self.body_state = BodyState::Fixed;
            }
            return Ok(());
        }
        self.body_state = match self.kind {
            // A request without a length and without chunking has no body.
            MessageKind::Request => BodyState::Done,
            MessageKind::Response => BodyState::ToEof,
        };
        Ok(())
    }

    fn implied_empty(&self) -> bool {
        if (100..200).contains(&self.status_code)
            || self.status_code == 204
            || self.status_code == 304
        {
            return true;
        }
        matches!(self.req_method, Some(ref m) if *m == Method::HEAD)
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .any(|v| {
                v.to_str()
                    .map(|s| s.to_ascii_lowercase().contains("chunked"))
                    .unwrap_or(false)
            })
    }

    fn content_length(&self) -> Result<Option<usize>> {
        let value = match self.headers.get(header::CONTENT_LENGTH) {
            Some(v) => v,
            None => return Ok(None),
        };
        let parsed = value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::new_parse(Parse::ContentLength))?;
        let len = usize::try_from(parsed).map_err(|_| Error::new_parse(Parse::ContentLength))?;
        Ok(Some(len))
    }

    /// Advances the chunk framing machine one byte; returns true when
    /// the final chunk terminator has been consumed.
    fn step_chunk(&mut self, state: ChunkState, c: u8) -> Result<bool> {
        use self::ChunkState::*;

        let next = match state {
            SizeStart => match c {
                _ if c.is_ascii_hexdigit() => {
                    self.chunk_size_str.clear();
                    self.chunk_size_str.push(c as char);
                    Size
                }
                // Tolerate stray whitespace before the size line.
                b' ' | b'\t' | b'\r' | b'\n' => SizeStart,
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
            Size => match c {
                _ if c.is_ascii_hexdigit() => {
                    if self.chunk_size_str.len() >= CHUNK_SIZE_DIGITS_MAX {
                        return Err(Error::new_parse(Parse::Chunk));
                    }
                    self.chunk_size_str.push(c as char);
                    Size
                }
                b' ' | b'\t' => SizeWs,
                b';' => Extension,
                b'\r' => SizeLf,
                b'\n' => return self.chunk_size_done(),
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
            SizeWs => match c {
                b' ' | b'\t' => SizeWs,
                b';' => Extension,
                b'\r' => SizeLf,
                b'\n' => return self.chunk_size_done(),
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
            Extension => match c {
                b'\r' => SizeLf,
                b'\n' => return self.chunk_size_done(),
                _ => {
                    self.trailer_len += 1;
                    if self.trailer_len > HEADERS_SECTION_MAX {
                        return Err(Error::new_parse(Parse::Chunk));
                    }
                    Extension
                }
            },
            SizeLf => match c {
                b'\n' => return self.chunk_size_done(),
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
            // Data is consumed in bulk by the caller.
            Data => unreachable!("chunk data consumed in bulk"),
            DataCr => match c {
                b'\r' => DataLf,
                b'\n' => SizeStart,
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
            DataLf => match c {
                b'\n' => SizeStart,
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
            TrailerStart => match c {
                b'\r' => FinalLf,
                b'\n' => return Ok(true),
                _ => {
                    self.trailer_len += 1;
                    if self.trailer_len > HEADERS_SECTION_MAX {
                        return Err(Error::new_parse(Parse::Chunk));
                    }
                    TrailerLine
                }
            },
            TrailerLine => match c {
                b'\n' => TrailerStart,
                _ => {
                    self.trailer_len += 1;
                    if self.trailer_len > HEADERS_SECTION_MAX {
                        return Err(Error::new_parse(Parse::Chunk));
                    }
                    TrailerLine
                }
            },
            FinalLf => match c {
                b'\n' => return Ok(true),
                _ => return Err(Error::new_parse(Parse::Chunk)),
            },
        };
        self.body_state = BodyState::Chunked(next);
        Ok(false)
    }

    fn chunk_size_done(&mut self) -> Result<bool> {
        let size = u64::from_str_radix(&self.chunk_size_str, 16)
            .map_err(|_| Error::new_parse(Parse::Chunk))?;
        let size = usize::try_from(size).map_err(|_| Error::new_parse(Parse::Chunk))?;
        if size == 0 {
            self.body_state = BodyState::Chunked(ChunkState::TrailerStart);
        } else {
            if self.content.len() + size > self.max_content_length {
                return Err(Error::new_parse(Parse::TooLarge));
            }
            self.content_remaining = size;
            self.body_state = BodyState::Chunked(ChunkState::Data);
        }
        Ok(false)
    }

    /// Seals a parsed request: marks it valid and fills in the query
    /// and cookie parameters.
    pub fn finish_request(&mut self) -> Result<HttpRequest> {
        debug_assert!(self.is_done());
        let mut request = HttpRequest::new();
        let head = request.head_mut();
        head.version_major = self.version_major;
        head.version_minor = self.version_minor;
        head.chunks_supported = (self.version_major, self.version_minor) >= (1, 1);
        head.transfer_encoding = if self.chunked {
            TransferEncoding::Chunked
        } else {
            TransferEncoding::Identity
        };
        head.headers = mem::take(&mut self.headers);
        head.content = mem::take(&mut self.content).freeze();
        head.is_valid = true;

        let method =
            Method::from_bytes(self.method.as_bytes()).map_err(|_| Error::new_method())?;
        let resource = String::from_utf8_lossy(&self.resource).into_owned();
        let query_string = String::from_utf8_lossy(&self.query_string).into_owned();

        let mut query_params = Params::new();
        if !query_string.is_empty()
            && !parse_url_encoded(&mut query_params, query_string.as_bytes())
        {
            warn!("request query string parsing failed (URI)");
        }
        if request.head().content_type_is(CONTENT_TYPE_URLENCODED) {
            let content = request.head().content.clone();
            if !parse_url_encoded(&mut query_params, &content) {
                warn!("request query string parsing failed (POST content)");
            }
        }

        let mut cookies = Params::new();
        for value in request.head().headers.get_all(header::COOKIE) {
            if !parse_cookie_header(&mut cookies, value.as_bytes()) {
                warn!("cookie header parsing failed");
            }
        }

        request.set_method(method);
        request.set_resource(resource);
        request.set_query_string(query_string);
        *request.query_params_mut() = query_params;
        *request.cookies_mut() = cookies;
        Ok(request)
    }

    /// Seals a parsed response: marks it valid and records the status
    /// line fields.
    pub fn finish_response(&mut self) -> Result<HttpResponse> {
        debug_assert!(self.is_done());
        let mut response = HttpResponse::new();
        let head = response.head_mut();
        head.version_major = self.version_major;
        head.version_minor = self.version_minor;
        head.chunks_supported = (self.version_major, self.version_minor) >= (1, 1);
        head.transfer_encoding = if self.chunked {
            TransferEncoding::Chunked
        } else {
            TransferEncoding::Identity
        };
        head.headers = mem::take(&mut self.headers);
        head.content = mem::take(&mut self.content).freeze();
        head.is_valid = true;

        response.set_status_code(self.status_code);
        response.set_status_message(String::from_utf8_lossy(&self.status_message).into_owned());
        if let Some(ref method) = self.req_method {
            response.set_request_method(method.clone());
        }
        Ok(response)
    }

    /// Hands back the raw parsed content (used by stream decoders that
    /// do not build full message objects).
    pub fn take_content(&mut self) -> Bytes {
        mem::take(&mut self.content).freeze()
    }
}

/// Splits URL-encoded `name=value&...` pairs into `params`.
///
/// Values are stored raw; callers apply [`url_decode`](super::url_decode)
/// where decoded text is needed. Returns false if the input is
/// malformed (the parameters collected so far are kept).
pub(crate) fn parse_url_encoded(params: &mut Params, data: &[u8]) -> bool {
    let mut name = String::new();
    let mut value = String::new();
    let mut in_value = false;

    for &c in data {
        if in_value {
            if c == b'&' {
                params.insert(mem::take(&mut name), mem::take(&mut value));
                in_value = false;
            } else if is_control(c) || value.len() >= QUERY_VALUE_MAX {
                return false;
            } else {
                value.push(c as char);
            }
        } else if c == b'=' {
            if name.is_empty() {
                return false;
            }
            in_value = true;
        } else if c == b'&' {
            if name.is_empty() {
                return false;
            }
            params.insert(mem::take(&mut name), String::new());
        } else if is_control(c) || name.len() >= QUERY_NAME_MAX {
            return false;
        } else {
            name.push(c as char);
        }
    }

    if !name.is_empty() {
        params.insert(name, value);
    }
    true
}

/// Parses a `Cookie` header value per RFC 2109.
///
/// Cookie names are case-insensitive and stored lowercased; attributes
/// beginning with `$` (`$Path`, `$Domain`, ...) are ignored; quoted
/// values are unwrapped.
pub(crate) fn parse_cookie_header(params: &mut Params, data: &[u8]) -> bool {
    #[derive(PartialEq)]
    enum State {
        Name,
        Value,
        Ignore,
    }

    let mut state = State::Name;
    let mut name = String::new();
    let mut value = String::new();
    let mut quote: u8 = 0;

    let mut commit = |name: &mut String, value: &mut String| {
        if !name.starts_with('$') {
            params.insert(mem::take(name), mem::take(value));
        } else {
            name.clear();
            value.clear();
        }
    };

    for &c in data {
        match state {
            State::Name => {
                if c == b'=' {
                    if name.is_empty() {
                        return false;
                    }
                    quote = 0;
                    state = State::Value;
                } else if c == b';' || c == b',' {
                    // Empty names occur naturally after quoted values.
                    if !name.is_empty() {
                        commit(&mut name, &mut value);
                    }
                } else if c != b' ' {
                    if is_control(c) || name.len() >= COOKIE_NAME_MAX {
                        return false;
                    }
                    name.push((c as char).to_ascii_lowercase());
                }
            }
            State::Value => {
                if quote == 0 {
                    if c == b';' || c == b',' {
                        commit(&mut name, &mut value);
                        state = State::Name;
                    } else if (c == b'\'' || c == b'"') && value.is_empty() {
                        quote = c;
                    } else if c != b' ' {
                        if is_control(c) || value.len() >= COOKIE_VALUE_MAX {
                            return false;
                        }
                        value.push(c as char);
                    }
                } else if c == quote {
                    commit(&mut name, &mut value);
                    state = State::Ignore;
                } else if value.len() >= COOKIE_VALUE_MAX {
                    return false;
                } else {
                    value.push(c as char);
                }
            }
            State::Ignore => {
                if c == b';' || c == b',' {
                    state = State::Name;
                }
            }
        }
    }

    if !name.is_empty() {
        commit(&mut name, &mut value);
    }
    true
}

fn is_control(c: u8) -> bool {
    c < 32 || c == 127
}

fn is_special(c: u8) -> bool {
    matches!(
        c,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii() && !is_control(c) && !is_special(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn parse_request(bytes: &[u8]) -> Result<(HttpRequest, BytesMut)> {
        let mut parser = Parser::new_request();
        let mut buf = BytesMut::from(bytes);
        match parser.parse(&mut buf)? {
            ParseStatus::Accept => Ok((parser.finish_request()?, buf)),
            ParseStatus::Continue => Err(Error::new_incomplete()),
        }
    }

    fn parse_response(bytes: &[u8]) -> Result<HttpResponse> {
        let mut parser = Parser::new_response();
        let mut buf = BytesMut::from(bytes);
        match parser.parse(&mut buf)? {
            ParseStatus::Accept => parser.finish_response(),
            ParseStatus::Continue => {
                parser.finish()?;
                parser.finish_response()
            }
        }
    }

    #[test]
    fn simple_get() {
        let (req, rest) =
            parse_request(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        assert_eq!(req.method(), &Method::GET);
        assert_eq!(req.resource(), "/hello");
        assert_eq!(req.head().version(), (1, 1));
        assert_eq!(req.head().header("host"), Some("localhost"));
        assert!(req.head().is_valid());
        assert!(rest.is_empty());
    }

    #[test]
    fn query_string_and_params() {
        let (req, _) = parse_request(b"GET /login?user=mike&pass=secret HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.resource(), "/login");
        assert_eq!(req.query_string(), "user=mike&pass=secret");
        assert_eq!(req.query("user"), Some("mike"));
        assert_eq!(req.query("pass"), Some("secret"));
    }

    #[test]
    fn post_content_length_body() {
        let (req, _) = parse_request(
            b"POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 7\r\n\r\na=1&b=2",
        )
        .unwrap();
        assert_eq!(req.head().content(), &b"a=1&b=2"[..]);
        assert_eq!(req.query("a"), Some("1"));
        assert_eq!(req.query("b"), Some("2"));
    }

    #[test]
    fn incremental_byte_at_a_time() {
        let raw = b"GET /abc HTTP/1.0\r\nX-Test: one\r\nContent-Length: 3\r\n\r\nxyz";
        let mut parser = Parser::new_request();
        let mut status = ParseStatus::Continue;
        for (n, &b) in raw.iter().enumerate() {
            let mut buf = BytesMut::from(&[b][..]);
            status = parser.parse(&mut buf).unwrap();
            if n + 1 < raw.len() {
                assert_eq!(status, ParseStatus::Continue);
            }
        }
        assert_eq!(status, ParseStatus::Accept);
        assert_eq!(parser.total_bytes_read(), raw.len() as u64);
        let req = parser.finish_request().unwrap();
        assert_eq!(req.head().content(), &b"xyz"[..]);
        assert_eq!(req.head().version(), (1, 0));
    }

    #[test]
    fn bare_lf_line_endings() {
        let (req, _) = parse_request(b"GET / HTTP/1.1\nHost: a\nX-B: c\n\n").unwrap();
        assert_eq!(req.head().header("host"), Some("a"));
        assert_eq!(req.head().header("x-b"), Some("c"));
    }

    #[test]
    fn folded_header_appends_with_space() {
        let (req, _) =
            parse_request(b"GET / HTTP/1.1\r\nX-Long: first\r\n    second\r\nHost: h\r\n\r\n")
                .unwrap();
        assert_eq!(req.head().header("x-long"), Some("first second"));
        assert_eq!(req.head().header("host"), Some("h"));
    }

    #[test]
    fn cr_without_lf_rejects() {
        let err = parse_request(b"GET / HTTP/1.1\r\nHost: a\rX: y\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn malformed_first_line_rejects() {
        assert!(parse_request(b"GET\x01 / HTTP/1.1\r\n\r\n")
            .unwrap_err()
            .is_parse());
        assert!(parse_request(b"GET / HTXP/1.1\r\n\r\n")
            .unwrap_err()
            .is_parse());
    }

    #[test]
    fn oversized_header_line_rejects() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(HEADER_LINE_MAX + 1));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = parse_request(&raw).unwrap_err();
        assert!(err.is_parse_too_large());
    }

    #[test]
    fn bad_content_length_rejects() {
        let err = parse_request(b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn chunked_response_from_spec() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.head().content(), &b"Hello World"[..]);
        assert_eq!(
            resp.head().transfer_encoding(),
            TransferEncoding::Chunked
        );
    }

    #[test]
    fn chunk_split_invariance() {
        // Any split of the chunked serialization yields the same body.
        let raw: &[u8] =
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n8\r\ndefghijk\r\n1\r\nl\r\n0\r\n\r\n";
        for split in 1..raw.len() {
            let mut parser = Parser::new_request();
            let mut first = BytesMut::from(&raw[..split]);
            let status = parser.parse(&mut first).unwrap();
            assert!(first.is_empty());
            if status == ParseStatus::Continue {
                let mut second = BytesMut::from(&raw[split..]);
                assert_eq!(parser.parse(&mut second).unwrap(), ParseStatus::Accept);
            }
            let req = parser.finish_request().unwrap();
            assert_eq!(req.head().content(), &b"abcdefghijkl"[..]);
        }
    }

    #[test]
    fn chunk_extension_ignored() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4;name=value\r\nwxyz\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.head().content(), &b"wxyz"[..]);
    }

    #[test]
    fn chunk_trailers_skipped() {
        let resp = parse_response(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\nExpires: never\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.head().content(), &b"ok"[..]);
    }

    #[test]
    fn bad_chunk_size_rejects() {
        let mut parser = Parser::new_response();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"[..],
        );
        let err = parser.parse(&mut buf).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn response_eof_body() {
        let mut parser = Parser::new_response();
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\npartial content"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Continue);
        assert_eq!(parser.finish().unwrap(), ParseStatus::Accept);
        assert!(parser.eof_terminated());
        let resp = parser.finish_response().unwrap();
        assert_eq!(resp.head().content(), &b"partial content"[..]);
    }

    #[test]
    fn implied_empty_statuses() {
        for raw in [
            &b"HTTP/1.1 204 No Content\r\nContent-Length: 10\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n"[..],
            &b"HTTP/1.1 100 Continue\r\n\r\n"[..],
        ] {
            let resp = parse_response(raw).unwrap();
            assert!(resp.head().content().is_empty());
        }
    }

    #[test]
    fn head_response_has_no_body() {
        let mut parser = Parser::new_response();
        parser.set_request_method(&Method::HEAD);
        let mut buf =
            BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\n"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Accept);
        let resp = parser.finish_response().unwrap();
        assert!(resp.head().content().is_empty());
    }

    #[test]
    fn premature_eof_is_incomplete() {
        let mut parser = Parser::new_request();
        let mut buf = BytesMut::from(&b"GET / HT"[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Continue);
        assert!(parser.finish().unwrap_err().is_incomplete_message());
    }

    #[test]
    fn pipelined_requests_leave_bookmark() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut parser = Parser::new_request();
        let mut buf = BytesMut::from(&raw[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Accept);
        let first = parser.finish_request().unwrap();
        assert_eq!(first.resource(), "/a");
        // The next message begins at the byte following the final CRLF.
        assert!(buf.starts_with(b"GET /b"));

        parser.reset();
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Accept);
        let second = parser.finish_request().unwrap();
        assert_eq!(second.resource(), "/b");
        assert!(buf.is_empty());
    }

    #[test]
    fn cookie_header_parsing() {
        let (req, _) = parse_request(
            b"GET / HTTP/1.1\r\nCookie: $Version=1; Name=value; Other=\"quoted text\"; a=b\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.cookie("name"), Some("value"));
        assert_eq!(req.cookie("other"), Some("quoted text"));
        assert_eq!(req.cookie("a"), Some("b"));
        assert_eq!(req.cookie("$version"), None);
    }

    #[test]
    fn url_encoded_edge_cases() {
        let mut params = Params::new();
        assert!(parse_url_encoded(&mut params, b"a=1&empty=&flag&b=2"));
        assert_eq!(params.get("a"), Some("1"));
        assert_eq!(params.get("empty"), Some(""));
        assert_eq!(params.get("flag"), Some(""));
        assert_eq!(params.get("b"), Some("2"));

        let mut bad = Params::new();
        assert!(!parse_url_encoded(&mut bad, b"=orphan"));
    }

    #[test]
    fn status_line_without_message() {
        let resp = parse_response(b"HTTP/1.1 204\r\n\r\n").unwrap();
        assert_eq!(resp.status_code(), 204);
        assert_eq!(resp.status_message(), "");
    }
}
