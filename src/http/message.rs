//! Common container and wire drivers shared by requests and responses.

use std::cell::RefCell;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

use crate::http::parser::{ParseStatus, Parser};
use crate::tcp::{Lifecycle, TcpConnection};
use crate::Result;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    /// The body is sent as-is, delimited by `Content-Length` (or the
    /// end of the stream).
    #[default]
    Identity,
    /// The body is sent as hex-size-prefixed chunks.
    Chunked,
}

/// State common to HTTP requests and responses: version, the ordered
/// case-insensitive header multimap, and the payload content.
#[derive(Debug, Clone)]
pub struct MessageHead {
    pub(crate) version_major: u16,
    pub(crate) version_minor: u16,
    pub(crate) headers: HeaderMap,
    pub(crate) content: Bytes,
    pub(crate) transfer_encoding: TransferEncoding,
    pub(crate) chunks_supported: bool,
    pub(crate) is_valid: bool,
}

impl Default for MessageHead {
    fn default() -> Self {
        MessageHead {
            version_major: 1,
            version_minor: 1,
            headers: HeaderMap::new(),
            content: Bytes::new(),
            transfer_encoding: TransferEncoding::Identity,
            chunks_supported: true,
            is_valid: false,
        }
    }
}

impl MessageHead {
    /// Creates an empty HTTP/1.1 message head.
    pub fn new() -> MessageHead {
        MessageHead::default()
    }

    /// The message's `(major, minor)` HTTP version.
    pub fn version(&self) -> (u16, u16) {
        (self.version_major, self.version_minor)
    }

    /// Major version number.
    pub fn version_major(&self) -> u16 {
        self.version_major
    }

    /// Minor version number.
    pub fn version_minor(&self) -> u16 {
        self.version_minor
    }

    /// Sets the HTTP version.
    pub fn set_version(&mut self, major: u16, minor: u16) {
        self.version_major = major;
        self.version_minor = minor;
        self.chunks_supported = (major, minor) >= (1, 1);
    }

    /// The header multimap.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the header multimap.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the first value of `name`, if present and readable as
    /// a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Appends a header, keeping any existing values for the name.
    ///
    /// Invalid names or values are dropped with a warning rather than
    /// poisoning the message.
    pub fn add_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => warn!(name, "dropping invalid header"),
        }
    }

    /// Replaces all values of a header with a single value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(name, "dropping invalid header"),
        }
    }

    /// The payload content.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// The payload content as shared bytes.
    pub fn content_bytes(&self) -> Bytes {
        self.content.clone()
    }

    /// Length of the payload content.
    pub fn content_length(&self) -> usize {
        self.content.len()
    }

    /// Replaces the payload content.
    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.content = content.into();
    }

    /// How the body was (or will be) framed.
    pub fn transfer_encoding(&self) -> TransferEncoding {
        self.transfer_encoding
    }

    /// Sets the body framing used when the message is sent.
    pub fn set_transfer_encoding(&mut self, te: TransferEncoding) {
        self.transfer_encoding = te;
    }

    /// True when the peer speaks HTTP/1.1 or later and can accept
    /// chunked transfers.
    pub fn chunks_supported(&self) -> bool {
        self.chunks_supported
    }

    /// Overrides the chunk-support flag.
    pub fn set_chunks_supported(&mut self, supported: bool) {
        self.chunks_supported = supported;
    }

    /// True only after a parser accepted this message.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    /// True when the `Content-Type` header starts with `prefix`.
    pub fn content_type_is(&self, prefix: &str) -> bool {
        self.header(header::CONTENT_TYPE.as_str())
            .map(|v| v.trim_start().starts_with(prefix))
            .unwrap_or(false)
    }

    /// Whether the connection should stay open after this message.
    ///
    /// HTTP/1.1 and later keep the connection unless `Connection:
    /// close` is present; earlier versions close it unless the
    /// `Connection` header asks for `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self
            .header(header::CONNECTION.as_str())
            .map(|v| v.trim().to_ascii_lowercase());
        if (self.version_major, self.version_minor) >= (1, 1) {
            connection.as_deref() != Some("close")
        } else {
            connection
                .as_deref()
                .map(|v| v.contains("keep-alive"))
                .unwrap_or(false)
        }
    }

    /// Resets the head to an empty message.
    pub fn clear(&mut self) {
        *self = MessageHead::default();
    }
}

/// Drives the parser against a connection until a whole message has
/// been accepted. The connection's unconsumed buffer (the pipeline
/// bookmark) is used before any socket read.
pub(crate) async fn drive_receive(parser: &mut Parser, conn: &mut TcpConnection) -> Result<()> {
    loop {
        if conn.read_buffer().is_empty() {
            let n = conn.read_some().await?;
            if n == 0 {
                // End of stream: accept a close-delimited body, or
                // report the message as incomplete.
                parser.finish()?;
                return Ok(());
            }
        }
        if let ParseStatus::Accept = parser.parse(conn.read_buf_mut())? {
            return Ok(());
        }
    }
}

/// Chooses the connection disposition after a received message.
pub(crate) fn apply_lifecycle(head: &MessageHead, conn: &mut TcpConnection, force_close: bool) {
    if !force_close && head.keep_alive() {
        if conn.read_buffer().is_empty() {
            conn.set_lifecycle(Lifecycle::KeepAlive);
        } else {
            // Bytes past the parsed message are a pipelined follow-on.
            conn.set_lifecycle(Lifecycle::Pipelined);
        }
    } else {
        conn.set_lifecycle(Lifecycle::Close);
    }
}

/// Serializes every header as `Name: Value CRLF`.
pub(crate) fn append_headers(dst: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(CRLF);
    }
}

/// Serializes one extra header line.
pub(crate) fn append_header(dst: &mut BytesMut, name: &str, value: &str) {
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value.as_bytes());
    dst.extend_from_slice(CRLF);
}

/// Appends a `Date` header line.
///
/// The formatted value only changes once per second, so each thread
/// keeps the last rendering keyed by its epoch second and reuses it
/// until the clock ticks over.
pub(crate) fn append_date_header(dst: &mut BytesMut) {
    thread_local! {
        static LAST_DATE: RefCell<(u64, String)> = RefCell::new((u64::MAX, String::new()));
    }
    let now = SystemTime::now();
    let second = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    LAST_DATE.with(|cached| {
        let mut cached = cached.borrow_mut();
        if cached.0 != second {
            cached.1 = httpdate::fmt_http_date(now);
            cached.0 = second;
        }
        append_header(dst, "Date", &cached.1);
    });
}

/// Appends the standard connection/body-framing headers and the blank
/// separator line, then returns the body buffers to follow the head.
///
/// Headers already present on the message are never overridden, which
/// keeps re-serialized messages faithful to what was parsed.
pub(crate) fn finish_head_and_body(
    dst: &mut BytesMut,
    head: &MessageHead,
    keep_alive: bool,
    suppress_content_length: bool,
    headers_only: bool,
) -> Vec<Bytes> {
    if !head.headers.contains_key(header::CONNECTION) {
        append_header(
            dst,
            "Connection",
            if keep_alive { "Keep-Alive" } else { "close" },
        );
    }

    let chunked =
        head.transfer_encoding == TransferEncoding::Chunked && head.chunks_supported;
    if chunked {
        if !head.headers.contains_key(header::TRANSFER_ENCODING) {
            append_header(dst, "Transfer-Encoding", "chunked");
        }
    } else if !suppress_content_length && !head.headers.contains_key(header::CONTENT_LENGTH) {
        append_header(dst, "Content-Length", &head.content_length().to_string());
    }

    dst.extend_from_slice(CRLF);

    let mut buffers = Vec::with_capacity(3);
    if headers_only {
        return buffers;
    }
    if chunked {
        if !head.content.is_empty() {
            let mut frame = BytesMut::with_capacity(18);
            frame.extend_from_slice(format!("{:x}", head.content.len()).as_bytes());
            frame.extend_from_slice(CRLF);
            buffers.push(frame.freeze());
            buffers.push(head.content.clone());
            buffers.push(Bytes::from_static(b"\r\n0\r\n\r\n"));
        } else {
            buffers.push(Bytes::from_static(b"0\r\n\r\n"));
        }
    } else if !head.content.is_empty() {
        buffers.push(head.content.clone());
    }
    buffers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with(version: (u16, u16), connection: Option<&str>) -> MessageHead {
        let mut head = MessageHead::new();
        head.set_version(version.0, version.1);
        if let Some(value) = connection {
            head.add_header("Connection", value);
        }
        head
    }

    #[test]
    fn keep_alive_decision_table() {
        // (major, minor, connection header, expected)
        let table = [
            ((1, 1), None, true),
            ((1, 1), Some("close"), false),
            ((1, 1), Some("Close"), false),
            ((1, 1), Some("keep-alive"), true),
            ((1, 0), None, false),
            ((1, 0), Some("keep-alive"), true),
            ((1, 0), Some("Keep-Alive"), true),
            ((1, 0), Some("close"), false),
            ((0, 9), None, false),
            ((1, 2), None, true),
        ];
        for (version, connection, expected) in table {
            let head = head_with(version, connection);
            assert_eq!(
                head.keep_alive(),
                expected,
                "version {:?} connection {:?}",
                version,
                connection
            );
        }
    }

    #[test]
    fn header_multimap_case_insensitive() {
        let mut head = MessageHead::new();
        head.add_header("X-Thing", "one");
        head.add_header("x-thing", "two");
        assert_eq!(head.header("X-THING"), Some("one"));
        assert_eq!(head.headers().get_all("x-thing").iter().count(), 2);
    }

    #[test]
    fn chunked_body_framing() {
        let mut head = MessageHead::new();
        head.set_content(&b"Hello World"[..]);
        head.set_transfer_encoding(TransferEncoding::Chunked);
        let mut dst = BytesMut::new();
        let bufs = finish_head_and_body(&mut dst, &head, true, false, false);
        let wire: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
        assert_eq!(wire, b"b\r\nHello World\r\n0\r\n\r\n");
        assert!(!dst[..].windows(14).any(|w| w == b"Content-Length"));
    }

    #[test]
    fn date_header_is_well_formed() {
        let mut dst = BytesMut::new();
        append_date_header(&mut dst);
        let text = String::from_utf8_lossy(&dst).into_owned();
        assert!(text.starts_with("Date: "));
        assert!(text.ends_with(" GMT\r\n"));
        assert!(httpdate::parse_http_date(
            text.trim_start_matches("Date: ").trim_end()
        )
        .is_ok());
    }

    #[test]
    fn identity_body_gets_content_length() {
        let mut head = MessageHead::new();
        head.set_content(&b"abc"[..]);
        let mut dst = BytesMut::new();
        let bufs = finish_head_and_body(&mut dst, &head, true, false, false);
        let text = String::from_utf8_lossy(&dst).into_owned();
        assert!(text.contains("Content-Length: 3\r\n"));
        assert_eq!(&bufs[0][..], b"abc");
    }
}
