//! Decodes captured HTTP traffic into clickstream events.
//!
//! One [`HttpProtocol`] tracks a single client/server byte stream
//! pair. Client-to-server bytes feed a request parser and
//! server-to-client bytes feed a response parser; when a response
//! completes, the pair is folded into one event and both parsers are
//! re-armed for the next exchange on the stream.

use bytes::BytesMut;
use regex::Regex;
use tracing::debug;

use crate::http::{HttpRequest, HttpResponse, ParseStatus, Parser};
use crate::reactor::event::{Event, EventPtr};
use crate::reactor::vocabulary::{TermId, TermType, Vocabulary};
use crate::{Error, Result};

/// Direction of a captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server (a request stream).
    ClientToServer,
    /// Server to client (a response stream).
    ServerToClient,
}

/// Clickstream vocabulary URIs resolved by [`HttpProtocol`].
pub mod terms {
    /// Bytes sent client-to-server.
    pub const CS_BYTES: &str = "urn:vocab:clickstream#cs-bytes";
    /// Bytes sent server-to-client.
    pub const SC_BYTES: &str = "urn:vocab:clickstream#sc-bytes";
    /// Total bytes in both directions.
    pub const BYTES: &str = "urn:vocab:clickstream#bytes";
    /// Response status code.
    pub const STATUS: &str = "urn:vocab:clickstream#status";
    /// Response status message.
    pub const COMMENT: &str = "urn:vocab:clickstream#comment";
    /// Request method.
    pub const METHOD: &str = "urn:vocab:clickstream#method";
    /// Full request URI (stem plus query).
    pub const URI: &str = "urn:vocab:clickstream#uri";
    /// Request URI stem.
    pub const URI_STEM: &str = "urn:vocab:clickstream#uri-stem";
    /// Request URI query string.
    pub const URI_QUERY: &str = "urn:vocab:clickstream#uri-query";
    /// Raw request first line.
    pub const REQUEST: &str = "urn:vocab:clickstream#request";
    /// `Host` request header.
    pub const HOST: &str = "urn:vocab:clickstream#host";
    /// `Referer` request header.
    pub const REFERER: &str = "urn:vocab:clickstream#referer";
    /// `User-Agent` request header.
    pub const USERAGENT: &str = "urn:vocab:clickstream#useragent";
    /// 1 when the response was served from cache (304), else 0.
    pub const CACHED: &str = "urn:vocab:clickstream#cached";
    /// Extracted request content.
    pub const CS_CONTENT: &str = "urn:vocab:clickstream#cs-content";
    /// Extracted response content.
    pub const SC_CONTENT: &str = "urn:vocab:clickstream#sc-content";
    /// The clickstream event type itself.
    pub const EVENT_TYPE: &str = "urn:vocab:clickstream#http-event";
}

/// Builds a vocabulary containing every clickstream term.
pub fn clickstream_vocabulary() -> Vocabulary {
    let mut vocabulary = Vocabulary::new();
    vocabulary.add_term(terms::EVENT_TYPE, TermType::Object);
    vocabulary.add_term(terms::CS_BYTES, TermType::UInt);
    vocabulary.add_term(terms::SC_BYTES, TermType::UInt);
    vocabulary.add_term(terms::BYTES, TermType::UInt);
    vocabulary.add_term(terms::STATUS, TermType::UInt);
    vocabulary.add_term(terms::COMMENT, TermType::String);
    vocabulary.add_term(terms::METHOD, TermType::String);
    vocabulary.add_term(terms::URI, TermType::String);
    vocabulary.add_term(terms::URI_STEM, TermType::String);
    vocabulary.add_term(terms::URI_QUERY, TermType::String);
    vocabulary.add_term(terms::REQUEST, TermType::String);
    vocabulary.add_term(terms::HOST, TermType::String);
    vocabulary.add_term(terms::REFERER, TermType::String);
    vocabulary.add_term(terms::USERAGENT, TermType::String);
    vocabulary.add_term(terms::CACHED, TermType::UInt);
    vocabulary.add_term(terms::CS_CONTENT, TermType::String);
    vocabulary.add_term(terms::SC_CONTENT, TermType::String);
    vocabulary
}

/// Controls whether message content is copied onto events.
#[derive(Debug, Clone)]
pub struct ExtractionRule {
    content_type: Option<Regex>,
    max_size: usize,
}

impl ExtractionRule {
    /// Extracts content whose `Content-Type` matches `pattern` and
    /// whose size does not exceed `max_size`.
    pub fn new(pattern: &str, max_size: usize) -> Result<ExtractionRule> {
        let content_type = Regex::new(pattern).map_err(Error::new_config)?;
        Ok(ExtractionRule {
            content_type: Some(content_type),
            max_size,
        })
    }

    /// A rule that never extracts content.
    pub fn disabled() -> ExtractionRule {
        ExtractionRule {
            content_type: None,
            max_size: 0,
        }
    }

    fn matches(&self, content_type: Option<&str>, size: usize) -> bool {
        if self.max_size == 0 || size == 0 || size > self.max_size {
            return false;
        }
        match (&self.content_type, content_type) {
            (Some(regex), Some(value)) => regex.is_match(value),
            (Some(_), None) => false,
            (None, _) => false,
        }
    }
}

struct ClickstreamTerms {
    event_type: TermId,
    cs_bytes: TermId,
    sc_bytes: TermId,
    bytes: TermId,
    status: TermId,
    comment: TermId,
    method: TermId,
    uri: TermId,
    uri_stem: TermId,
    uri_query: TermId,
    request: TermId,
    host: TermId,
    referer: TermId,
    useragent: TermId,
    cached: TermId,
    cs_content: TermId,
    sc_content: TermId,
}

impl ClickstreamTerms {
    fn resolve(vocabulary: &Vocabulary) -> Result<ClickstreamTerms> {
        Ok(ClickstreamTerms {
            event_type: vocabulary.require_term(terms::EVENT_TYPE)?,
            cs_bytes: vocabulary.require_term(terms::CS_BYTES)?,
            sc_bytes: vocabulary.require_term(terms::SC_BYTES)?,
            bytes: vocabulary.require_term(terms::BYTES)?,
            status: vocabulary.require_term(terms::STATUS)?,
            comment: vocabulary.require_term(terms::COMMENT)?,
            method: vocabulary.require_term(terms::METHOD)?,
            uri: vocabulary.require_term(terms::URI)?,
            uri_stem: vocabulary.require_term(terms::URI_STEM)?,
            uri_query: vocabulary.require_term(terms::URI_QUERY)?,
            request: vocabulary.require_term(terms::REQUEST)?,
            host: vocabulary.require_term(terms::HOST)?,
            referer: vocabulary.require_term(terms::REFERER)?,
            useragent: vocabulary.require_term(terms::USERAGENT)?,
            cached: vocabulary.require_term(terms::CACHED)?,
            cs_content: vocabulary.require_term(terms::CS_CONTENT)?,
            sc_content: vocabulary.require_term(terms::SC_CONTENT)?,
        })
    }
}

/// Pairs one captured request stream with its response stream,
/// emitting a clickstream event per completed exchange.
pub struct HttpProtocol {
    terms: ClickstreamTerms,
    request_parser: Parser,
    response_parser: Parser,
    request: Option<HttpRequest>,
    request_content_rule: ExtractionRule,
    response_content_rule: ExtractionRule,
}

impl std::fmt::Debug for HttpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProtocol")
            .field("request_pending", &self.request.is_some())
            .finish()
    }
}

impl HttpProtocol {
    /// Creates a decoder with content extraction disabled. Every
    /// clickstream term must be defined in the vocabulary.
    pub fn new(vocabulary: &Vocabulary) -> Result<HttpProtocol> {
        Ok(HttpProtocol {
            terms: ClickstreamTerms::resolve(vocabulary)?,
            request_parser: Parser::new_request(),
            response_parser: Parser::new_response(),
            request: None,
            request_content_rule: ExtractionRule::disabled(),
            response_content_rule: ExtractionRule::disabled(),
        })
    }

    /// Configures extraction of request content onto events.
    pub fn set_request_content_rule(&mut self, rule: ExtractionRule) {
        self.request_content_rule = rule;
    }

    /// Configures extraction of response content onto events.
    pub fn set_response_content_rule(&mut self, rule: ExtractionRule) {
        self.response_content_rule = rule;
    }

    /// Feeds captured bytes in one direction. Returns an event when
    /// these bytes complete a request/response exchange.
    pub fn read_next(&mut self, direction: Direction, data: &[u8]) -> Result<Option<EventPtr>> {
        let mut buf = BytesMut::from(data);
        match direction {
            Direction::ClientToServer => {
                if let ParseStatus::Accept = self.request_parser.parse(&mut buf)? {
                    let request = self.request_parser.finish_request()?;
                    // The response needs the request's context (HEAD
                    // semantics); emission waits for the response.
                    self.response_parser.set_request_method(request.method());
                    self.request = Some(request);
                    if !buf.is_empty() {
                        debug!(
                            bytes = buf.len(),
                            "unparsed bytes after request; next exchange assumed"
                        );
                    }
                }
                Ok(None)
            }
            Direction::ServerToClient => {
                if let ParseStatus::Accept = self.response_parser.parse(&mut buf)? {
                    let response = self.response_parser.finish_response()?;
                    return Ok(Some(self.generate_event(&response)?));
                }
                Ok(None)
            }
        }
    }

    /// Signals that the captured streams ended; a close-delimited
    /// response still produces its event.
    pub fn read_eof(&mut self) -> Result<Option<EventPtr>> {
        if self.request.is_none() {
            return Ok(None);
        }
        match self.response_parser.finish() {
            Ok(ParseStatus::Accept) => {
                let response = self.response_parser.finish_response()?;
                Ok(Some(self.generate_event(&response)?))
            }
            Ok(ParseStatus::Continue) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn generate_event(&mut self, response: &HttpResponse) -> Result<EventPtr> {
        let request = self.request.take().ok_or_else(|| {
            Error::new_reactor(
                crate::error::Reactor::NotRunning,
                "response completed before any request".to_string(),
            )
        })?;
        let terms = &self.terms;

        let cs_bytes = self.request_parser.total_bytes_read();
        let sc_bytes = self.response_parser.total_bytes_read();

        let mut event = Event::new(terms.event_type);
        event.set_uint(terms.cs_bytes, cs_bytes);
        event.set_uint(terms.sc_bytes, sc_bytes);
        event.set_uint(terms.bytes, cs_bytes + sc_bytes);
        event.set_uint(terms.status, response.status_code() as u64);
        event.set_str(terms.comment, response.status_message());
        event.set_str(terms.method, request.method().as_str());

        let mut uri = request.resource().to_string();
        if !request.query_string().is_empty() {
            uri.push('?');
            uri.push_str(request.query_string());
        }
        event.set_str(terms.uri, uri);
        event.set_str(terms.uri_stem, request.resource());
        event.set_str(terms.uri_query, request.query_string());
        event.set_str(terms.request, request.first_line());
        event.set_str(terms.host, request.head().header("host").unwrap_or(""));
        event.set_str(terms.referer, request.head().header("referer").unwrap_or(""));
        event.set_str(
            terms.useragent,
            request.head().header("user-agent").unwrap_or(""),
        );
        event.set_uint(terms.cached, u64::from(response.status_code() == 304));

        if self.request_content_rule.matches(
            request.head().header("content-type"),
            request.head().content_length(),
        ) {
            event.set_str(
                terms.cs_content,
                String::from_utf8_lossy(request.head().content()).into_owned(),
            );
        }
        if self.response_content_rule.matches(
            response.head().header("content-type"),
            response.head().content_length(),
        ) {
            event.set_str(
                terms.sc_content,
                String::from_utf8_lossy(response.head().content()).into_owned(),
            );
        }

        // Re-arm both parsers for the next exchange on this stream.
        self.request_parser.reset();
        self.request_parser.reset_byte_counter();
        self.response_parser.reset();
        self.response_parser.reset_byte_counter();
        Ok(EventPtr::new(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-agent\r\n\r\n";
    const RESPONSE: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";

    fn protocol() -> HttpProtocol {
        HttpProtocol::new(&clickstream_vocabulary()).unwrap()
    }

    fn term(uri: &str) -> TermId {
        clickstream_vocabulary().find_term(uri).unwrap()
    }

    #[test]
    fn one_exchange_yields_one_event() {
        let mut protocol = protocol();
        assert!(protocol
            .read_next(Direction::ClientToServer, REQUEST)
            .unwrap()
            .is_none());
        let event = protocol
            .read_next(Direction::ServerToClient, RESPONSE)
            .unwrap()
            .expect("event after response");

        assert_eq!(event.get_uint(term(terms::STATUS)), Some(200));
        assert_eq!(
            event.get_uint(term(terms::BYTES)),
            Some((REQUEST.len() + RESPONSE.len()) as u64)
        );
        assert_eq!(
            event.get_uint(term(terms::CS_BYTES)),
            Some(REQUEST.len() as u64)
        );
        assert_eq!(event.get_uint(term(terms::CACHED)), Some(0));
        assert_eq!(event.get_str(term(terms::METHOD)), Some("GET"));
        assert_eq!(event.get_str(term(terms::URI)), Some("/index.html?q=1"));
        assert_eq!(event.get_str(term(terms::URI_STEM)), Some("/index.html"));
        assert_eq!(event.get_str(term(terms::URI_QUERY)), Some("q=1"));
        assert_eq!(event.get_str(term(terms::HOST)), Some("example.com"));
        assert_eq!(event.get_str(term(terms::USERAGENT)), Some("test-agent"));
    }

    #[test]
    fn not_modified_marks_cached() {
        let mut protocol = protocol();
        protocol
            .read_next(Direction::ClientToServer, REQUEST)
            .unwrap();
        let event = protocol
            .read_next(
                Direction::ServerToClient,
                b"HTTP/1.1 304 Not Modified\r\n\r\n",
            )
            .unwrap()
            .expect("event");
        assert_eq!(event.get_uint(term(terms::CACHED)), Some(1));
    }

    #[test]
    fn parsers_reset_between_exchanges() {
        let mut protocol = protocol();
        for _ in 0..2 {
            protocol
                .read_next(Direction::ClientToServer, REQUEST)
                .unwrap();
            let event = protocol
                .read_next(Direction::ServerToClient, RESPONSE)
                .unwrap()
                .expect("event");
            // Byte counters restart for every exchange.
            assert_eq!(
                event.get_uint(term(terms::BYTES)),
                Some((REQUEST.len() + RESPONSE.len()) as u64)
            );
        }
    }

    #[test]
    fn content_extraction_honors_rule() {
        let mut protocol = protocol();
        protocol.set_response_content_rule(ExtractionRule::new("text/.*", 1024).unwrap());
        protocol
            .read_next(Direction::ClientToServer, REQUEST)
            .unwrap();
        let event = protocol
            .read_next(Direction::ServerToClient, RESPONSE)
            .unwrap()
            .expect("event");
        assert_eq!(event.get_str(term(terms::SC_CONTENT)), Some("hello"));
        // Request had no body, so nothing was extracted for it.
        assert_eq!(event.get_str(term(terms::CS_CONTENT)), None);
    }

    #[test]
    fn oversized_content_is_not_extracted() {
        let mut protocol = protocol();
        protocol.set_response_content_rule(ExtractionRule::new(".*", 3).unwrap());
        protocol
            .read_next(Direction::ClientToServer, REQUEST)
            .unwrap();
        let event = protocol
            .read_next(Direction::ServerToClient, RESPONSE)
            .unwrap()
            .expect("event");
        assert_eq!(event.get_str(term(terms::SC_CONTENT)), None);
    }

    #[test]
    fn split_delivery_accumulates() {
        let mut protocol = protocol();
        let (req_a, req_b) = REQUEST.split_at(10);
        assert!(protocol
            .read_next(Direction::ClientToServer, req_a)
            .unwrap()
            .is_none());
        assert!(protocol
            .read_next(Direction::ClientToServer, req_b)
            .unwrap()
            .is_none());
        let (resp_a, resp_b) = RESPONSE.split_at(20);
        assert!(protocol
            .read_next(Direction::ServerToClient, resp_a)
            .unwrap()
            .is_none());
        assert!(protocol
            .read_next(Direction::ServerToClient, resp_b)
            .unwrap()
            .is_some());
    }
}
