//! Assembles and sends responses, with optional chunked streaming.

use bytes::{Bytes, BytesMut};

use crate::http::message::{self, TransferEncoding, CRLF};
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;
use crate::http::types;
use crate::tcp::{Lifecycle, TcpConnection};
use crate::Result;

/// Builds a response for a request and writes it to the connection.
///
/// Content can be appended piecewise; [`send`](ResponseWriter::send)
/// delivers everything with a `Content-Length`, while
/// [`send_chunk`](ResponseWriter::send_chunk) /
/// [`send_final`](ResponseWriter::send_final) stream each accumulated
/// region as an HTTP chunk when the peer supports chunking.
#[derive(Debug)]
pub struct ResponseWriter {
    response: HttpResponse,
    regions: Vec<Bytes>,
    headers_sent: bool,
    chunked: bool,
}

impl ResponseWriter {
    /// Creates a writer whose response mirrors the request's version
    /// and HEAD semantics. The content type defaults to HTML.
    pub fn new(request: &HttpRequest) -> ResponseWriter {
        let mut response = HttpResponse::new_for_request(request);
        response
            .head_mut()
            .set_header("Content-Type", types::CONTENT_TYPE_HTML);
        ResponseWriter {
            response,
            regions: Vec::new(),
            headers_sent: false,
            chunked: false,
        }
    }

    /// Creates a writer around an existing response.
    pub fn from_response(response: HttpResponse) -> ResponseWriter {
        ResponseWriter {
            response,
            regions: Vec::new(),
            headers_sent: false,
            chunked: false,
        }
    }

    /// The response being built.
    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    /// Mutable access to the response being built.
    pub fn response_mut(&mut self) -> &mut HttpResponse {
        &mut self.response
    }

    /// Appends content, copying it into the writer.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        if !data.as_ref().is_empty() {
            self.regions.push(Bytes::copy_from_slice(data.as_ref()));
        }
    }

    /// Appends static content without copying.
    pub fn write_static(&mut self, data: &'static str) {
        if !data.is_empty() {
            self.regions.push(Bytes::from_static(data.as_bytes()));
        }
    }

    /// Number of content bytes accumulated and not yet sent.
    pub fn pending_len(&self) -> usize {
        self.regions.iter().map(|b| b.len()).sum()
    }

    /// Discards accumulated content.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Sends the whole response with identity framing and a
    /// `Content-Length`. Returns the bytes written.
    pub async fn send(mut self, conn: &mut TcpConnection) -> Result<usize> {
        let content = self.concat_regions();
        self.response.head_mut().set_content(content);
        self.response
            .head_mut()
            .set_transfer_encoding(TransferEncoding::Identity);
        self.response.send(conn).await
    }

    /// Streams the accumulated regions now, each framed as an HTTP
    /// chunk when the peer supports chunking. The head is written
    /// before the first chunk.
    pub async fn send_chunk(&mut self, conn: &mut TcpConnection) -> Result<usize> {
        let mut buffers = Vec::with_capacity(1 + self.regions.len() * 3);
        if !self.headers_sent {
            self.chunked = self.response.head().chunks_supported();
            buffers.push(self.head_bytes(conn.keep_alive()));
            self.headers_sent = true;
        }
        for region in self.regions.drain(..) {
            if self.chunked {
                let mut frame = BytesMut::with_capacity(18);
                frame.extend_from_slice(format!("{:x}", region.len()).as_bytes());
                frame.extend_from_slice(CRLF);
                buffers.push(frame.freeze());
                buffers.push(region);
                buffers.push(Bytes::from_static(b"\r\n"));
            } else {
                buffers.push(region);
            }
        }
        conn.write_buffers(&buffers).await
    }

    /// Sends any remaining regions and terminates the stream. With
    /// chunking this writes the zero chunk; without it the message is
    /// delimited by closing the connection.
    pub async fn send_final(mut self, conn: &mut TcpConnection) -> Result<usize> {
        let mut total = self.send_chunk(conn).await?;
        if self.chunked {
            total += conn
                .write_buffers(&[Bytes::from_static(b"0\r\n\r\n")])
                .await?;
        } else {
            // No length and no chunking: the peer learns the end of
            // the body from the close.
            conn.set_lifecycle(Lifecycle::Close);
        }
        Ok(total)
    }

    fn concat_regions(&mut self) -> Bytes {
        if self.regions.len() == 1 {
            return self.regions.pop().expect("one region");
        }
        let total = self.pending_len();
        let mut content = BytesMut::with_capacity(total);
        for region in self.regions.drain(..) {
            content.extend_from_slice(&region);
        }
        content.freeze()
    }

    fn head_bytes(&self, keep_alive: bool) -> Bytes {
        let response = &self.response;
        let mut buf = BytesMut::with_capacity(256);
        buf.extend_from_slice(response.first_line().as_bytes());
        buf.extend_from_slice(CRLF);
        message::append_headers(&mut buf, response.head().headers());
        if !response.head().headers().contains_key(http::header::DATE) {
            message::append_date_header(&mut buf);
        }
        if !response.head().headers().contains_key(http::header::CONNECTION) {
            message::append_header(
                &mut buf,
                "Connection",
                if keep_alive && self.chunked { "Keep-Alive" } else { "close" },
            );
        }
        if self.chunked {
            message::append_header(&mut buf, "Transfer-Encoding", "chunked");
        }
        buf.extend_from_slice(CRLF);
        buf.freeze()
    }
}
