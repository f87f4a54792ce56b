//! HTTP request messages.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;

use crate::http::auth::User;
use crate::http::message::{self, MessageHead, CRLF};
use crate::http::parser::{ParseStatus, Parser, DEFAULT_CONTENT_MAX};
use crate::http::types::Params;
use crate::tcp::TcpConnection;
use crate::{Error, Result};

/// An HTTP request message.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    head: MessageHead,
    method: Method,
    resource: String,
    original_resource: String,
    query_string: String,
    query_params: Params,
    cookies: Params,
    remote_ip: Option<IpAddr>,
    user: Option<Arc<User>>,
}

impl HttpRequest {
    /// Creates an empty `GET` request.
    pub fn new() -> HttpRequest {
        HttpRequest::default()
    }

    /// The shared message head (version, headers, content).
    pub fn head(&self) -> &MessageHead {
        &self.head
    }

    /// Mutable access to the message head.
    pub fn head_mut(&mut self) -> &mut MessageHead {
        &mut self.head
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Sets the request method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// The resource path (no query string).
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Sets the resource, also recording it as the original resource.
    pub fn set_resource(&mut self, resource: impl Into<String>) {
        self.resource = resource.into();
        self.original_resource = self.resource.clone();
    }

    /// Rewrites the resource (after a redirect), preserving the
    /// original for diagnostics.
    pub fn change_resource(&mut self, resource: impl Into<String>) {
        self.resource = resource.into();
    }

    /// The resource as originally requested, before any redirects.
    pub fn original_resource(&self) -> &str {
        &self.original_resource
    }

    /// The raw query string (no leading `?`).
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// Sets the raw query string.
    pub fn set_query_string(&mut self, query: impl Into<String>) {
        self.query_string = query.into();
    }

    /// Returns the first (still URL-encoded) value of a query
    /// parameter.
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name)
    }

    /// All parsed query parameters.
    pub fn query_params(&self) -> &Params {
        &self.query_params
    }

    pub(crate) fn query_params_mut(&mut self) -> &mut Params {
        &mut self.query_params
    }

    /// Returns a cookie value by (lowercase) name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name)
    }

    /// All cookies presented with the request.
    pub fn cookies(&self) -> &Params {
        &self.cookies
    }

    pub(crate) fn cookies_mut(&mut self) -> &mut Params {
        &mut self.cookies
    }

    /// Address of the peer that sent the request, when known.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    /// Records the peer address.
    pub fn set_remote_ip(&mut self, ip: Option<IpAddr>) {
        self.remote_ip = ip;
    }

    /// The authenticated user attached by an authenticator, if any.
    pub fn user(&self) -> Option<&Arc<User>> {
        self.user.as_ref()
    }

    /// Attaches the authenticated user.
    pub fn set_user(&mut self, user: Arc<User>) {
        self.user = Some(user);
    }

    /// The request line, reconstructed.
    pub fn first_line(&self) -> String {
        let (major, minor) = self.head.version();
        if self.query_string.is_empty() {
            format!("{} {} HTTP/{}.{}", self.method, self.resource, major, minor)
        } else {
            format!(
                "{} {}?{} HTTP/{}.{}",
                self.method, self.resource, self.query_string, major, minor
            )
        }
    }

    /// Reads one request from the connection, consuming any pipelined
    /// bookmark first, and sets the connection lifecycle afterwards.
    pub async fn receive(conn: &mut TcpConnection) -> Result<HttpRequest> {
        HttpRequest::receive_with_max(conn, DEFAULT_CONTENT_MAX).await
    }

    /// [`receive`](HttpRequest::receive) with an explicit body size cap.
    pub async fn receive_with_max(
        conn: &mut TcpConnection,
        max_content_length: usize,
    ) -> Result<HttpRequest> {
        let mut parser = Parser::new_request();
        parser.set_max_content_length(max_content_length);
        message::drive_receive(&mut parser, conn).await?;
        let mut request = parser.finish_request()?;
        if request.head().version_major() > 1 {
            return Err(Error::new_version());
        }
        request.set_remote_ip(Some(conn.remote_addr().ip()));
        message::apply_lifecycle(request.head(), conn, parser.eof_terminated());
        Ok(request)
    }

    /// Sends the request over a connection; returns the bytes written.
    pub async fn send(&self, conn: &mut TcpConnection) -> Result<usize> {
        let buffers = self.prepare_buffers(conn.keep_alive());
        conn.write_buffers(&buffers).await
    }

    /// Serializes the request into a blocking writer (offline use).
    pub fn write_to(&self, out: &mut dyn io::Write) -> io::Result<usize> {
        let mut total = 0;
        for buf in self.prepare_buffers(true) {
            out.write_all(&buf)?;
            total += buf.len();
        }
        Ok(total)
    }

    /// Parses one request from a blocking reader (offline use).
    pub fn read_from(input: &mut dyn io::Read) -> Result<HttpRequest> {
        let mut parser = Parser::new_request();
        let mut chunk = [0u8; 4096];
        loop {
            let n = input.read(&mut chunk).map_err(Error::new_io)?;
            if n == 0 {
                parser.finish()?;
                break;
            }
            let mut buf = BytesMut::from(&chunk[..n]);
            if let ParseStatus::Accept = parser.parse(&mut buf)? {
                break;
            }
        }
        parser.finish_request()
    }

    fn prepare_buffers(&self, keep_alive: bool) -> Vec<Bytes> {
        let mut head_buf = BytesMut::with_capacity(256);
        head_buf.extend_from_slice(self.first_line().as_bytes());
        head_buf.extend_from_slice(CRLF);
        message::append_headers(&mut head_buf, self.head.headers());
        let body = message::finish_head_and_body(&mut head_buf, &self.head, keep_alive, false, false);

        let mut buffers = Vec::with_capacity(1 + body.len());
        buffers.push(head_buf.freeze());
        buffers.extend(body);
        buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Parser;

    #[test]
    fn round_trip_preserves_message() {
        let mut request = HttpRequest::new();
        request.set_method(Method::POST);
        request.set_resource("/submit");
        request.set_query_string("a=1");
        request.head_mut().set_version(1, 1);
        request.head_mut().add_header("Host", "example.com");
        request.head_mut().add_header("X-Two", "first");
        request.head_mut().add_header("X-Two", "second");
        request.head_mut().set_content(&b"hello body"[..]);

        let mut wire = Vec::new();
        request.write_to(&mut wire).unwrap();

        let mut parser = Parser::new_request();
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(parser.parse(&mut buf).unwrap(), ParseStatus::Accept);
        let parsed = parser.finish_request().unwrap();

        assert_eq!(parsed.method(), request.method());
        assert_eq!(parsed.resource(), request.resource());
        assert_eq!(parsed.query_string(), request.query_string());
        assert_eq!(parsed.head().version(), request.head().version());
        assert_eq!(parsed.head().header("host"), Some("example.com"));
        let two: Vec<_> = parsed.head().headers().get_all("x-two").iter().collect();
        assert_eq!(two.len(), 2);
        assert_eq!(parsed.head().content(), request.head().content());
        assert!(parsed.head().is_valid());
    }

    #[test]
    fn first_line_includes_query() {
        let mut request = HttpRequest::new();
        request.set_method(Method::GET);
        request.set_resource("/p");
        request.set_query_string("q=1");
        assert_eq!(request.first_line(), "GET /p?q=1 HTTP/1.1");
    }

    #[test]
    fn change_resource_keeps_original() {
        let mut request = HttpRequest::new();
        request.set_resource("/old");
        request.change_resource("/new");
        assert_eq!(request.resource(), "/new");
        assert_eq!(request.original_resource(), "/old");
    }
}
