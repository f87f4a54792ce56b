//! A single TCP connection with buffering and lifecycle tagging.

use std::io::{self, IoSlice};
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::{Error, Result};

/// Capacity reserved for each socket read.
pub const READ_BUFFER_SIZE: usize = 8192;

/// What happens to a connection once the current message completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
    /// Shut down and close the socket.
    #[default]
    Close,
    /// Leave the socket open and wait for the next request.
    KeepAlive,
    /// Bytes for the next message are already buffered; handle it
    /// without waiting for a read event.
    Pipelined,
}

/// A TCP connection that owns its socket and read buffer.
///
/// Reads append to the buffer and the HTTP parser consumes from its
/// front, so any bytes left after a completed message are the bookmark
/// for a pipelined follow-on.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    lifecycle: Lifecycle,
    remote_addr: SocketAddr,
}

impl TcpConnection {
    /// Wraps an accepted stream.
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> TcpConnection {
        TcpConnection {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            lifecycle: Lifecycle::Close,
            remote_addr,
        }
    }

    /// Opens a client connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<TcpConnection> {
        let stream = TcpStream::connect(addr).await.map_err(Error::new_io)?;
        let remote_addr = stream.peer_addr().map_err(Error::new_io)?;
        Ok(TcpConnection::new(stream, remote_addr))
    }

    /// Address of the peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The connection's disposition after the current message.
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Tags the connection's disposition after the current message.
    pub fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
    }

    /// True unless the connection is tagged to close.
    pub fn keep_alive(&self) -> bool {
        self.lifecycle != Lifecycle::Close
    }

    /// True when buffered bytes of a pipelined message remain.
    pub fn pipelined(&self) -> bool {
        self.lifecycle == Lifecycle::Pipelined
    }

    /// Unconsumed buffered bytes (the pipeline bookmark).
    pub fn read_buffer(&self) -> &[u8] {
        &self.read_buf
    }

    pub(crate) fn read_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Reads once from the socket, appending to the read buffer.
    /// Returns the number of bytes read; zero means end of stream.
    pub async fn read_some(&mut self) -> Result<usize> {
        self.read_buf.reserve(READ_BUFFER_SIZE);
        let n = self
            .stream
            .read_buf(&mut self.read_buf)
            .await
            .map_err(Error::new_io)?;
        trace!(bytes = n, "read from socket");
        Ok(n)
    }

    /// Writes an entire buffer to the socket.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<usize> {
        self.stream.write_all(data).await.map_err(Error::new_io)?;
        Ok(data.len())
    }

    /// Writes a list of buffers with vectored I/O.
    pub async fn write_buffers(&mut self, buffers: &[Bytes]) -> Result<usize> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        let mut index = 0;
        let mut offset = 0;
        while index < buffers.len() {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(buffers.len() - index);
            slices.push(IoSlice::new(&buffers[index][offset..]));
            for buf in &buffers[index + 1..] {
                slices.push(IoSlice::new(buf));
            }
            let mut written = self
                .stream
                .write_vectored(&slices)
                .await
                .map_err(Error::new_io)?;
            if written == 0 {
                return Err(Error::new_io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket write returned zero",
                )));
            }
            while written > 0 {
                let remaining = buffers[index].len() - offset;
                if written >= remaining {
                    written -= remaining;
                    index += 1;
                    offset = 0;
                    if index == buffers.len() {
                        break;
                    }
                } else {
                    offset += written;
                    written = 0;
                }
            }
        }
        trace!(bytes = total, "wrote to socket");
        Ok(total)
    }

    /// Shuts down the write side of the socket. The connection is
    /// fully closed when it is dropped.
    pub async fn close(&mut self) -> Result<()> {
        self.lifecycle = Lifecycle::Close;
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            // The peer may already be gone; that is a normal close.
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::new_shutdown(e)),
        }
    }

    /// Discards buffered bytes (used after an aborted message).
    pub fn clear_read_buffer(&mut self) {
        let len = self.read_buf.len();
        self.read_buf.advance(len);
    }
}
