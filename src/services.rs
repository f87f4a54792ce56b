//! Bundled web services used by the daemon and the test suites.

use futures_util::future::BoxFuture;
use http::Method;

use crate::http::server::handle_method_not_allowed;
use crate::http::{HttpRequest, ResponseWriter, WebService};
use crate::tcp::TcpConnection;
use crate::Result;

/// Responds to `GET` and `HEAD` requests with a fixed HTML greeting;
/// other methods get a 405 with an `Allow` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct HelloService;

static HELLO_HTML: &str = "<html><body>Hello World!</body></html>\r\n\r\n";

impl WebService for HelloService {
    fn handle<'a>(
        &'a self,
        request: &'a HttpRequest,
        conn: &'a mut TcpConnection,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if *request.method() != Method::GET && *request.method() != Method::HEAD {
                handle_method_not_allowed(request, conn, "GET, HEAD").await?;
                return Ok(true);
            }
            let mut writer = ResponseWriter::new(request);
            writer.write_static(HELLO_HTML);
            writer.send(conn).await?;
            Ok(true)
        })
    }
}

/// Echoes the request line, headers, parameters, and content back as
/// plain text.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoService;

impl WebService for EchoService {
    fn handle<'a>(
        &'a self,
        request: &'a HttpRequest,
        conn: &'a mut TcpConnection,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut text = String::with_capacity(256);
            text.push_str(&request.first_line());
            text.push_str("\r\n\r\n[Headers]\r\n");
            for (name, value) in request.head().headers().iter() {
                text.push_str(name.as_str());
                text.push_str(": ");
                text.push_str(&String::from_utf8_lossy(value.as_bytes()));
                text.push_str("\r\n");
            }
            text.push_str("\r\n[Query Params]\r\n");
            for (name, value) in request.query_params().iter() {
                text.push_str(name);
                text.push_str(": ");
                text.push_str(value);
                text.push_str("\r\n");
            }
            text.push_str("\r\n[Cookie Params]\r\n");
            for (name, value) in request.cookies().iter() {
                text.push_str(name);
                text.push_str(": ");
                text.push_str(value);
                text.push_str("\r\n");
            }
            text.push_str("\r\n[POST Content]\r\n");
            text.push_str(&String::from_utf8_lossy(request.head().content()));

            let mut writer = ResponseWriter::new(request);
            writer
                .response_mut()
                .head_mut()
                .set_header("Content-Type", crate::http::CONTENT_TYPE_TEXT);
            writer.write(text);
            writer.send(conn).await?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_body_matches_expected_bytes() {
        assert_eq!(
            HELLO_HTML.as_bytes(),
            b"<html><body>Hello World!</body></html>\r\n\r\n"
        );
    }
}
