//! HTTP response messages.

use std::io;

use bytes::{Bytes, BytesMut};
use http::Method;

use crate::http::message::{self, MessageHead, CRLF};
use crate::http::parser::{Parser, DEFAULT_CONTENT_MAX};
use crate::http::request::HttpRequest;
use crate::http::types::reason_phrase;
use crate::tcp::TcpConnection;
use crate::{Error, Result};

/// An HTTP response message.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    head: MessageHead,
    status_code: u16,
    status_message: String,
    /// Method of the request being answered; a HEAD reply never
    /// carries content on the wire.
    request_method: Option<Method>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            head: MessageHead::new(),
            status_code: 200,
            status_message: "OK".to_string(),
            request_method: None,
        }
    }
}

impl HttpResponse {
    /// Creates a `200 OK` response.
    pub fn new() -> HttpResponse {
        HttpResponse::default()
    }

    /// Creates a response primed for a particular request: the version
    /// is mirrored, chunk support follows the request version, and
    /// HEAD semantics are recorded.
    pub fn new_for_request(request: &HttpRequest) -> HttpResponse {
        let mut response = HttpResponse::new();
        response.update_request_info(request);
        response
    }

    /// Copies version and method context from the request this
    /// response answers.
    pub fn update_request_info(&mut self, request: &HttpRequest) {
        let (major, minor) = request.head().version();
        self.head.set_version(major, minor);
        self.request_method = Some(request.method().clone());
    }

    /// The shared message head (version, headers, content).
    pub fn head(&self) -> &MessageHead {
        &self.head
    }

    /// Mutable access to the message head.
    pub fn head_mut(&mut self) -> &mut MessageHead {
        &mut self.head
    }

    /// The numeric status code.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Sets the status code, updating the reason phrase to the
    /// canonical one.
    pub fn set_status_code(&mut self, code: u16) {
        self.status_code = code;
        self.status_message = reason_phrase(code).to_string();
    }

    /// The status reason phrase.
    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// Overrides the reason phrase.
    pub fn set_status_message(&mut self, message: impl Into<String>) {
        self.status_message = message.into();
    }

    /// Method of the request this response answers, when known.
    pub fn request_method(&self) -> Option<&Method> {
        self.request_method.as_ref()
    }

    /// Records the method of the request this response answers.
    pub fn set_request_method(&mut self, method: Method) {
        self.request_method = Some(method);
    }

    /// The status line, reconstructed.
    pub fn first_line(&self) -> String {
        let (major, minor) = self.head.version();
        format!(
            "HTTP/{}.{} {} {}",
            major, minor, self.status_code, self.status_message
        )
    }

    /// True when the status code implies an empty body (1xx, 204,
    /// 304), regardless of any `Content-Length` header.
    pub fn implied_empty(&self) -> bool {
        (100..200).contains(&self.status_code)
            || self.status_code == 204
            || self.status_code == 304
    }

    /// Adds a `Set-Cookie` header (RFC 2109 syntax).
    pub fn set_cookie(&mut self, name: &str, value: &str, path: &str) {
        let header = make_set_cookie_header(name, value, path, None);
        self.head.add_header("Set-Cookie", &header);
    }

    /// Adds a `Set-Cookie` header with a `Max-Age` attribute.
    pub fn set_cookie_max_age(&mut self, name: &str, value: &str, path: &str, seconds: u64) {
        let header = make_set_cookie_header(name, value, path, Some(seconds));
        self.head.add_header("Set-Cookie", &header);
    }

    /// Adds a `Set-Cookie` header that removes the cookie from the
    /// client (`Max-Age=0`).
    pub fn delete_cookie(&mut self, name: &str, path: &str) {
        let header = make_set_cookie_header(name, "", path, Some(0));
        self.head.add_header("Set-Cookie", &header);
    }

    /// Reads one response from the connection. The request it answers
    /// provides HEAD semantics; the connection lifecycle is set
    /// afterwards.
    pub async fn receive(
        conn: &mut TcpConnection,
        request: &HttpRequest,
    ) -> Result<HttpResponse> {
        let mut parser = Parser::new_response();
        parser.set_max_content_length(DEFAULT_CONTENT_MAX);
        parser.set_request_method(request.method());
        message::drive_receive(&mut parser, conn).await?;
        let response = parser.finish_response()?;
        if response.head().version_major() > 1 {
            return Err(Error::new_version());
        }
        message::apply_lifecycle(response.head(), conn, parser.eof_terminated());
        Ok(response)
    }

    /// Sends the response over a connection; returns the bytes
    /// written. A reply to HEAD sends the head only.
    pub async fn send(&self, conn: &mut TcpConnection) -> Result<usize> {
        let buffers = self.prepare_buffers(conn.keep_alive());
        conn.write_buffers(&buffers).await
    }

    /// Parses one response from a blocking reader (offline use). The
    /// end of the input delimits a body without a declared length.
    pub fn read_from(input: &mut dyn io::Read) -> Result<HttpResponse> {
        let mut parser = Parser::new_response();
        let mut chunk = [0u8; 4096];
        loop {
            let n = input.read(&mut chunk).map_err(Error::new_io)?;
            if n == 0 {
                parser.finish()?;
                break;
            }
            let mut buf = BytesMut::from(&chunk[..n]);
            if let crate::http::ParseStatus::Accept = parser.parse(&mut buf)? {
                break;
            }
        }
        parser.finish_response()
    }

    /// Serializes the response into a blocking writer (offline use).
    pub fn write_to(&self, out: &mut dyn io::Write) -> io::Result<usize> {
        let mut total = 0;
        for buf in self.prepare_buffers(true) {
            out.write_all(&buf)?;
            total += buf.len();
        }
        Ok(total)
    }

    fn prepare_buffers(&self, keep_alive: bool) -> Vec<Bytes> {
        let headers_only = matches!(self.request_method, Some(ref m) if *m == Method::HEAD);
        let mut head_buf = BytesMut::with_capacity(256);
        head_buf.extend_from_slice(self.first_line().as_bytes());
        head_buf.extend_from_slice(CRLF);
        message::append_headers(&mut head_buf, self.head.headers());
        if !self.head.headers().contains_key(http::header::DATE) {
            message::append_date_header(&mut head_buf);
        }
        let body = message::finish_head_and_body(
            &mut head_buf,
            &self.head,
            keep_alive,
            self.implied_empty(),
            headers_only || self.implied_empty(),
        );

        let mut buffers = Vec::with_capacity(1 + body.len());
        buffers.push(head_buf.freeze());
        buffers.extend(body);
        buffers
    }
}

fn make_set_cookie_header(name: &str, value: &str, path: &str, max_age: Option<u64>) -> String {
    let mut header = format!("{}={}", name, value);
    if !path.is_empty() {
        header.push_str("; Path=");
        header.push_str(path);
    }
    if let Some(seconds) = max_age {
        header.push_str(&format!("; Max-Age={}", seconds));
    }
    header
}
