//! HTTP/1.x message types, incremental parser, writer, and server.

pub mod auth;
pub mod message;
mod parser;
pub mod request;
pub mod response;
pub mod server;
mod types;
pub mod writer;

pub use self::message::{MessageHead, TransferEncoding};
pub use self::parser::{ParseStatus, Parser};
pub use self::request::HttpRequest;
pub use self::response::HttpResponse;
pub use self::server::{HttpServer, WebService};
pub use self::types::{
    url_decode, Params, CONTENT_TYPE_HTML, CONTENT_TYPE_TEXT, CONTENT_TYPE_URLENCODED,
};
pub use self::writer::ResponseWriter;
