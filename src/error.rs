//! Error and Result types used throughout the crate.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have `pion::Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP messages, running
/// servers, or processing events.
///
/// # Formatting
///
/// The `Display` implementation of this type only prints the details of
/// this level of error, even though it may have been caused by another
/// error and contain that error in its source chain.
///
/// # Source
///
/// A `pion::Error` may be caused by another error. To aid debugging,
/// those are exposed in `Error::source()` as erased types. While it is
/// possible to check the exact type of the sources, they **can not be
/// depended on**.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// An HTTP message failed to parse.
    Parse(Parse),
    /// An `io::Error` occurred while reading or writing a stream.
    Io,
    /// The peer spoke a protocol this crate does not handle.
    Protocol(Protocol),
    /// Authentication was refused.
    Auth(Auth),
    /// A plug-in could not be loaded or resolved.
    Plugin(Plugin),
    /// A configuration file could not be applied.
    Config,
    /// A reactor graph operation was rejected.
    Reactor(Reactor),
    /// A storage backend operation failed.
    Storage(Storage),
    /// A web service or reactor callback failed.
    Service,
    /// The connection closed before a full message was transferred.
    IncompleteMessage,
    /// A pending operation was dropped before it could complete.
    Canceled,
    /// An error occurred shutting down a socket.
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum Parse {
    FirstLine,
    Method,
    Version,
    Status,
    Uri,
    Header,
    /// A single header line exceeded the line limit.
    HeaderTooLarge,
    /// The head, or a tracked message component, exceeded its limit.
    TooLarge,
    Chunk,
    ContentLength,
}

#[derive(Debug)]
pub(crate) enum Protocol {
    /// An HTTP version this server does not speak.
    Version,
    /// A method token that could not be represented.
    Method,
}

#[derive(Debug)]
pub(crate) enum Auth {
    /// No session cookie was presented.
    NoCookie,
    /// The presented session is not (or no longer) in the cache.
    Expired,
    /// Username/password did not match a known user.
    BadCredentials,
}

#[derive(Debug)]
pub(crate) enum Plugin {
    NotFound,
    Duplicate,
    Symbol,
    Open,
}

#[derive(Debug)]
pub(crate) enum Reactor {
    /// Adding the connection would create a cycle.
    Cycle,
    NotFound,
    NotRunning,
    Duplicate,
}

#[derive(Debug)]
pub(crate) enum Storage {
    /// A batched transaction failed after retries were exhausted.
    Transaction,
    /// Rows were diverted to the dead-letter sink.
    DeadLettered,
}

impl Error {
    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a parse error caused by an oversized
    /// message component.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Parse(Parse::TooLarge) | Kind::Parse(Parse::HeaderTooLarge)
        )
    }

    /// Returns true if this error was caused by stream I/O.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if the connection closed before a message could be
    /// completed.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if the error is about an operation canceled by
    /// shutdown.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the peer spoke a protocol this crate does not
    /// handle.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol(_))
    }

    /// Returns true if this was an authentication failure.
    pub fn is_auth(&self) -> bool {
        matches!(self.inner.kind, Kind::Auth(_))
    }

    /// Returns true if this error came from the plug-in loader.
    pub fn is_plugin(&self) -> bool {
        matches!(self.inner.kind, Kind::Plugin(_))
    }

    /// Returns true if a configuration file could not be applied.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Returns true if a reactor graph mutation was rejected because it
    /// would have created a cycle.
    pub fn is_reactor_cycle(&self) -> bool {
        matches!(self.inner.kind, Kind::Reactor(Reactor::Cycle))
    }

    /// Returns true if this error came from the reactor engine.
    pub fn is_reactor(&self) -> bool {
        matches!(self.inner.kind, Kind::Reactor(_))
    }

    /// Returns true if a storage backend rejected a batch.
    pub fn is_storage(&self) -> bool {
        matches!(self.inner.kind, Kind::Storage(_))
    }

    /// Returns true if this error came from user code (a web service
    /// or reactor callback).
    pub fn is_service(&self) -> bool {
        matches!(self.inner.kind, Kind::Service)
    }

    /// Wraps an error produced by user code so it can flow through
    /// `pion`'s `Result`. The server converts it into a 500 response
    /// carrying the error's message.
    pub fn new_service<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Service).with(cause)
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_version() -> Error {
        Error::new(Kind::Protocol(Protocol::Version))
    }

    pub(crate) fn new_method() -> Error {
        Error::new(Kind::Protocol(Protocol::Method))
    }

    pub(crate) fn new_auth(auth: Auth) -> Error {
        Error::new(Kind::Auth(auth))
    }

    pub(crate) fn new_plugin(plugin: Plugin, detail: String) -> Error {
        Error::new(Kind::Plugin(plugin)).with(detail)
    }

    pub(crate) fn new_config<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    pub(crate) fn new_reactor(reactor: Reactor, detail: String) -> Error {
        Error::new(Kind::Reactor(reactor)).with(detail)
    }

    pub(crate) fn new_storage<C: Into<Cause>>(storage: Storage, cause: C) -> Error {
        Error::new(Kind::Storage(storage)).with(cause)
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_shutdown(cause: std::io::Error) -> Error {
        Error::new(Kind::Shutdown).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::FirstLine) => "invalid HTTP first line parsed",
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Status) => "invalid HTTP status-code parsed",
            Kind::Parse(Parse::Uri) => "invalid URI parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::HeaderTooLarge) => "HTTP header line is too large",
            Kind::Parse(Parse::TooLarge) => "HTTP message component is too large",
            Kind::Parse(Parse::Chunk) => "invalid chunked encoding parsed",
            Kind::Parse(Parse::ContentLength) => "invalid content-length parsed",
            Kind::Io => "connection error",
            Kind::Protocol(Protocol::Version) => "unsupported HTTP version",
            Kind::Protocol(Protocol::Method) => "unsupported HTTP method",
            Kind::Auth(Auth::NoCookie) => "no authentication cookie presented",
            Kind::Auth(Auth::Expired) => "authentication session expired",
            Kind::Auth(Auth::BadCredentials) => "invalid credentials",
            Kind::Plugin(Plugin::NotFound) => "plug-in not found",
            Kind::Plugin(Plugin::Duplicate) => "duplicate plug-in identifier",
            Kind::Plugin(Plugin::Symbol) => "plug-in symbol missing",
            Kind::Plugin(Plugin::Open) => "plug-in library could not be opened",
            Kind::Config => "configuration error",
            Kind::Reactor(Reactor::Cycle) => "reactor connection would create a cycle",
            Kind::Reactor(Reactor::NotFound) => "reactor not found",
            Kind::Reactor(Reactor::NotRunning) => "reactor is not running",
            Kind::Reactor(Reactor::Duplicate) => "duplicate reactor identifier",
            Kind::Storage(Storage::Transaction) => "storage transaction failed",
            Kind::Storage(Storage::DeadLettered) => "storage batch was dead-lettered",
            Kind::Service => "web service failed",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Canceled => "operation was canceled",
            Kind::Shutdown => "error shutting down connection",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("pion::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}
