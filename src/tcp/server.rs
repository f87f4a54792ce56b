//! TCP acceptor that tracks live connections.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::scheduler::Scheduler;
use crate::tcp::TcpConnection;
use crate::{Error, Result};

/// Receiver half of the server's shutdown broadcast; per-connection
/// loops observe it at message boundaries.
pub type ShutdownWatch = watch::Receiver<bool>;

/// Async closure invoked for every accepted connection.
pub type ConnectionHandler =
    Arc<dyn Fn(TcpConnection, ShutdownWatch) -> BoxFuture<'static, ()> + Send + Sync>;

/// A TCP server that accepts connections and hands each one to a
/// connection handler running on the shared [`Scheduler`].
///
/// The server registers itself as an active user of the scheduler for
/// as long as it is listening; [`stop`](TcpServer::stop) waits until
/// every live connection has finished before releasing it.
pub struct TcpServer {
    scheduler: Arc<Scheduler>,
    endpoint: Mutex<SocketAddr>,
    handler: Mutex<Option<ConnectionHandler>>,
    inner: Arc<Inner>,
}

struct Inner {
    listening: Mutex<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Mutex<usize>,
    connections_drained: Condvar,
    server_has_stopped: Condvar,
    shutdown: Mutex<watch::Sender<bool>>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("endpoint", &self.endpoint())
            .field("listening", &self.is_listening())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl TcpServer {
    /// Creates a server bound to `endpoint` once started.
    pub fn new(scheduler: Arc<Scheduler>, endpoint: SocketAddr) -> TcpServer {
        let (tx, _rx) = watch::channel(false);
        TcpServer {
            scheduler,
            endpoint: Mutex::new(endpoint),
            handler: Mutex::new(None),
            inner: Arc::new(Inner {
                listening: Mutex::new(false),
                local_addr: Mutex::new(None),
                connections: Mutex::new(0),
                connections_drained: Condvar::new(),
                server_has_stopped: Condvar::new(),
                shutdown: Mutex::new(tx),
            }),
        }
    }

    /// Installs the per-connection handler. Must be called before
    /// [`start`](TcpServer::start).
    pub fn set_connection_handler(&self, handler: ConnectionHandler) {
        *lock(&self.handler) = Some(handler);
    }

    /// The scheduler this server runs on.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The configured bind endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        *lock(&self.endpoint)
    }

    /// Changes the bind endpoint, effective at the next start.
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *lock(&self.endpoint) = endpoint;
    }

    /// The actually bound address (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    /// True while the acceptor is running.
    pub fn is_listening(&self) -> bool {
        *lock(&self.inner.listening)
    }

    /// Number of connections currently being handled.
    pub fn connection_count(&self) -> usize {
        *lock(&self.inner.connections)
    }

    /// Binds the endpoint and begins accepting connections.
    pub fn start(&self) -> Result<()> {
        let mut listening = lock(&self.inner.listening);
        if *listening {
            return Ok(());
        }
        let handler = lock(&self.handler)
            .clone()
            .ok_or_else(|| Error::new_config("no connection handler installed"))?;

        self.scheduler.add_active_user()?;
        let listener = match bind_nonblocking(self.endpoint()) {
            Ok(listener) => listener,
            Err(e) => {
                self.scheduler.remove_active_user();
                return Err(e);
            }
        };
        let local_addr = listener.local_addr().map_err(Error::new_io)?;
        *lock(&self.inner.local_addr) = Some(local_addr);
        info!(addr = %local_addr, "starting server");

        let (tx, rx) = watch::channel(false);
        *lock(&self.inner.shutdown) = tx;

        let inner = Arc::clone(&self.inner);
        let handle = match self.scheduler.handle() {
            Ok(handle) => handle,
            Err(e) => {
                self.scheduler.remove_active_user();
                return Err(e);
            }
        };
        handle.spawn(accept_loop(listener, handler, inner, rx));
        *listening = true;
        Ok(())
    }

    /// Stops accepting, signals live connections, and blocks until the
    /// connection set drains, then releases the scheduler.
    pub fn stop(&self) {
        let mut listening = lock(&self.inner.listening);
        if !*listening {
            return;
        }
        info!(addr = ?self.local_addr(), "shutting down server");
        *listening = false;
        let _ = lock(&self.inner.shutdown).send(true);

        let mut connections = lock(&self.inner.connections);
        while *connections > 0 {
            debug!(connections = *connections, "waiting for connections to finish");
            connections = self
                .inner
                .connections_drained
                .wait(connections)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(connections);

        self.scheduler.remove_active_user();
        self.inner.server_has_stopped.notify_all();
    }

    /// Blocks the calling thread until the server has stopped.
    pub fn join(&self) {
        let mut listening = lock(&self.inner.listening);
        while *listening {
            listening = self
                .inner
                .server_has_stopped
                .wait(listening)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Inner {
    fn add_connection(&self) {
        *lock(&self.connections) += 1;
    }

    fn remove_connection(&self) {
        let mut connections = lock(&self.connections);
        *connections = connections.saturating_sub(1);
        if *connections == 0 {
            self.connections_drained.notify_all();
        }
    }
}

fn bind_nonblocking(endpoint: SocketAddr) -> Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(endpoint).map_err(Error::new_io)?;
    listener.set_nonblocking(true).map_err(Error::new_io)?;
    Ok(listener)
}

async fn accept_loop(
    listener: std::net::TcpListener,
    handler: ConnectionHandler,
    inner: Arc<Inner>,
    mut shutdown: ShutdownWatch,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "could not register listener with the scheduler");
            return;
        }
    };
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    info!(%peer, "new connection");
                    let conn = TcpConnection::new(stream, peer);
                    inner.add_connection();
                    let fut = handler(conn, shutdown.clone());
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        fut.await;
                        inner.remove_connection();
                    });
                }
                Err(e) => {
                    // Transient accept errors (e.g. fd exhaustion);
                    // back off instead of spinning.
                    warn!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("acceptor stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
