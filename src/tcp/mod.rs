//! TCP connection and server primitives.

mod connection;
mod server;

pub use self::connection::{Lifecycle, TcpConnection, READ_BUFFER_SIZE};
pub use self::server::{ConnectionHandler, ShutdownWatch, TcpServer};
