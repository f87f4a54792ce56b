//! HTTP server that routes resources to web services.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;
use tracing::{debug, error, info};

use crate::http::auth::Authenticator;
use crate::http::parser::DEFAULT_CONTENT_MAX;
use crate::http::request::HttpRequest;
use crate::http::writer::ResponseWriter;
use crate::plugin::{PluginInstance, PluginManager};
use crate::scheduler::Scheduler;
use crate::tcp::{Lifecycle, ShutdownWatch, TcpConnection, TcpServer};
use crate::{Error, Result};

/// Maximum times a request may be rewritten by redirects.
pub const MAX_REDIRECTS: u32 = 10;

/// A handler bound to a server resource.
///
/// Returning `Ok(false)` means no response was written; the server
/// then injects a 500. Errors are converted into 500 responses that
/// carry the error message.
pub trait WebService: Send + Sync {
    /// Handles one request on the given connection.
    fn handle<'a>(
        &'a self,
        request: &'a HttpRequest,
        conn: &'a mut TcpConnection,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Sets a named configuration option.
    fn set_option(&self, name: &str, value: &str) -> Result<()> {
        let _ = value;
        Err(Error::new_config(format!("unknown service option: {name}")))
    }

    /// Called when the owning server starts.
    fn start(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the owning server stops.
    fn stop(&self) {}
}

/// A routed service: shared directly or backed by a loaded plug-in.
#[derive(Debug, Clone)]
enum ServiceRef {
    Shared(Arc<dyn WebService>),
    Plugin(Arc<PluginInstance<Box<dyn WebService>>>),
}

impl ServiceRef {
    fn get(&self) -> &dyn WebService {
        match self {
            ServiceRef::Shared(s) => &**s,
            // Arc -> PluginInstance -> Box -> dyn WebService.
            ServiceRef::Plugin(p) => &****p,
        }
    }
}

impl fmt::Debug for dyn WebService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn WebService")
    }
}

/// Handler invoked for requests that fail or match nothing.
pub type RequestHandler =
    Arc<dyn for<'a> Fn(&'a HttpRequest, &'a mut TcpConnection) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Handler invoked for server errors, with a message.
pub type ErrorHandler = Arc<
    dyn for<'a> Fn(&'a HttpRequest, &'a mut TcpConnection, &'a str) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// An HTTP/1.x server dispatching requests to [`WebService`]s.
///
/// Dispatch picks the registered resource that is the longest prefix
/// of the requested path, where a prefix only matches at a `/`
/// boundary (`/foo` matches `/foo/bar` but not `/foobar`). Trailing
/// slashes are stripped before comparison.
pub struct HttpServer {
    tcp: TcpServer,
    services: Mutex<BTreeMap<String, ServiceRef>>,
    redirects: Mutex<HashMap<String, String>>,
    plugins: PluginManager<Box<dyn WebService>>,
    auth: Mutex<Option<Arc<dyn Authenticator>>>,
    max_content_length: Mutex<usize>,
    bad_request_handler: Mutex<RequestHandler>,
    not_found_handler: Mutex<RequestHandler>,
    server_error_handler: Mutex<ErrorHandler>,
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("tcp", &self.tcp)
            .field("services", &lock(&self.services).len())
            .finish()
    }
}

impl HttpServer {
    /// Creates a server bound to `endpoint` once started.
    pub fn new(scheduler: Arc<Scheduler>, endpoint: SocketAddr) -> Arc<HttpServer> {
        fn default_bad_request<'a>(
            request: &'a HttpRequest,
            conn: &'a mut TcpConnection,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(handle_bad_request(request, conn))
        }
        fn default_not_found<'a>(
            request: &'a HttpRequest,
            conn: &'a mut TcpConnection,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(handle_not_found(request, conn))
        }
        fn default_server_error<'a>(
            request: &'a HttpRequest,
            conn: &'a mut TcpConnection,
            message: &'a str,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(handle_server_error(request, conn, message))
        }

        let bad_request: RequestHandler = Arc::new(default_bad_request);
        let not_found: RequestHandler = Arc::new(default_not_found);
        let server_error: ErrorHandler = Arc::new(default_server_error);
        Arc::new(HttpServer {
            tcp: TcpServer::new(scheduler, endpoint),
            services: Mutex::new(BTreeMap::new()),
            redirects: Mutex::new(HashMap::new()),
            plugins: PluginManager::new(),
            auth: Mutex::new(None),
            max_content_length: Mutex::new(DEFAULT_CONTENT_MAX),
            bad_request_handler: Mutex::new(bad_request),
            not_found_handler: Mutex::new(not_found),
            server_error_handler: Mutex::new(server_error),
        })
    }

    /// Starts every registered service, then the acceptor.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let handler: crate::tcp::ConnectionHandler = Arc::new(move |conn, shutdown| {
            match weak.upgrade() {
                Some(server) => Box::pin(async move {
                    server.run_connection(conn, shutdown).await;
                }),
                None => Box::pin(async {}),
            }
        });
        self.tcp.set_connection_handler(handler);
        for (_, service) in lock(&self.services).iter() {
            service.get().start()?;
        }
        self.tcp.start()
    }

    /// Stops the acceptor, waits for connections to drain, and stops
    /// every service.
    pub fn stop(&self) {
        self.tcp.stop();
        for (_, service) in lock(&self.services).iter() {
            service.get().stop();
        }
    }

    /// Blocks the calling thread until the server has stopped.
    pub fn join(&self) {
        self.tcp.join();
    }

    /// The actually bound address (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Changes the bind endpoint, effective at the next start.
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        self.tcp.set_endpoint(endpoint);
    }

    /// Number of connections currently being handled.
    pub fn connection_count(&self) -> usize {
        self.tcp.connection_count()
    }

    /// Registers a service for a resource.
    pub fn add_service(&self, resource: &str, service: Arc<dyn WebService>) {
        let clean = strip_trailing_slash(resource).to_string();
        info!(resource = %clean, "added request handler for HTTP resource");
        lock(&self.services).insert(clean, ServiceRef::Shared(service));
    }

    /// Loads a service plug-in and registers it for a resource.
    pub fn load_service(&self, resource: &str, file: &str) -> Result<()> {
        let clean = strip_trailing_slash(resource).to_string();
        let instance = self.plugins.load(clean.clone(), file)?;
        info!(resource = %clean, plugin = file, "loaded web service plug-in");
        lock(&self.services).insert(clean, ServiceRef::Plugin(instance));
        Ok(())
    }

    /// Sets a named option on the service registered for `resource`.
    pub fn set_service_option(&self, resource: &str, name: &str, value: &str) -> Result<()> {
        let clean = strip_trailing_slash(resource);
        let service = lock(&self.services).get(clean).cloned().ok_or_else(|| {
            Error::new_plugin(
                crate::error::Plugin::NotFound,
                format!("no service registered for resource: {clean}"),
            )
        })?;
        service.get().set_option(name, value)
    }

    /// Removes the service registered for `resource`.
    pub fn remove_service(&self, resource: &str) {
        let clean = strip_trailing_slash(resource);
        lock(&self.services).remove(clean);
        let _ = self.plugins.remove(clean);
    }

    /// Removes every registered service.
    pub fn clear_services(&self) {
        lock(&self.services).clear();
        self.plugins.clear();
    }

    /// Adds a directory to the plug-in search path.
    pub fn add_plugin_directory(&self, dir: &str) -> Result<()> {
        self.plugins.add_plugin_directory(dir)
    }

    /// Redirects requests for one resource to another.
    pub fn add_redirect(&self, requested: &str, target: &str) {
        let requested = strip_trailing_slash(requested).to_string();
        let target = strip_trailing_slash(target).to_string();
        info!(from = %requested, to = %target, "added resource redirection");
        lock(&self.redirects).insert(requested, target);
    }

    /// Installs an authenticator consulted before dispatch.
    pub fn set_authenticator(&self, auth: Arc<dyn Authenticator>) {
        *lock(&self.auth) = Some(auth);
    }

    /// Caps the accepted request body size.
    pub fn set_max_content_length(&self, max: usize) {
        *lock(&self.max_content_length) = max;
    }

    /// Replaces the handler used when a request fails to parse.
    pub fn set_bad_request_handler(&self, handler: RequestHandler) {
        *lock(&self.bad_request_handler) = handler;
    }

    /// Replaces the handler used when no service matches.
    pub fn set_not_found_handler(&self, handler: RequestHandler) {
        *lock(&self.not_found_handler) = handler;
    }

    /// Replaces the handler used when a service fails.
    pub fn set_server_error_handler(&self, handler: ErrorHandler) {
        *lock(&self.server_error_handler) = handler;
    }

    async fn run_connection(self: Arc<Self>, mut conn: TcpConnection, mut shutdown: ShutdownWatch) {
        loop {
            let max = *lock(&self.max_content_length);
            let received = tokio::select! {
                received = HttpRequest::receive_with_max(&mut conn, max) => received,
                _ = shutdown.changed() => break,
            };
            match received {
                Ok(request) => {
                    if let Err(e) = self.handle_request(request, &mut conn).await {
                        info!(error = %e, "error handling request");
                        conn.set_lifecycle(Lifecycle::Close);
                    }
                }
                Err(e) if e.is_parse() || e.is_protocol() => {
                    info!(error = %e, "invalid HTTP request");
                    conn.set_lifecycle(Lifecycle::Close);
                    conn.clear_read_buffer();
                    let request = HttpRequest::new();
                    let handler = lock(&self.bad_request_handler).clone();
                    let _ = handler(&request, &mut conn).await;
                    break;
                }
                Err(e) if e.is_incomplete_message() => {
                    debug!("connection closed by peer");
                    break;
                }
                Err(e) => {
                    info!(error = %e, "lost connection");
                    break;
                }
            }
            match conn.lifecycle() {
                Lifecycle::Close => break,
                // Keep-alive waits for the next read; pipelined bytes
                // are consumed immediately from the bookmark.
                Lifecycle::KeepAlive | Lifecycle::Pipelined => continue,
            }
        }
        let _ = conn.close().await;
    }

    async fn handle_request(&self, mut request: HttpRequest, conn: &mut TcpConnection) -> Result<()> {
        debug!(resource = request.resource(), "received a valid HTTP request");
        let mut resource = strip_trailing_slash(request.resource()).to_string();

        let mut num_redirects = 0u32;
        loop {
            let target = lock(&self.redirects).get(&resource).cloned();
            let Some(target) = target else { break };
            num_redirects += 1;
            if num_redirects > MAX_REDIRECTS {
                error!(
                    resource = request.original_resource(),
                    "maximum number of redirects exceeded for requested resource"
                );
                let handler = lock(&self.server_error_handler).clone();
                return handler(
                    &request,
                    conn,
                    "maximum number of redirects exceeded for requested resource",
                )
                .await;
            }
            request.change_resource(target.clone());
            resource = target;
        }

        let auth = lock(&self.auth).clone();
        if let Some(auth) = auth {
            if !auth.handle(&mut request, conn).await? {
                debug!(
                    resource = %resource,
                    "authentication required for HTTP resource"
                );
                return Ok(());
            }
        }

        match self.find_service(&resource) {
            Some(service) => match service.get().handle(&request, conn).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    let handler = lock(&self.server_error_handler).clone();
                    handler(&request, conn, "service did not write a response").await
                }
                Err(e) => {
                    error!(error = %e, "HTTP request handler failed");
                    // Prefer the underlying cause; the kind description
                    // alone says little about what the service hit.
                    let message = std::error::Error::source(&e)
                        .map(|cause| cause.to_string())
                        .unwrap_or_else(|| e.to_string());
                    let handler = lock(&self.server_error_handler).clone();
                    handler(&request, conn, &message).await
                }
            },
            None => {
                info!(resource = %resource, "no request handlers found for resource");
                let handler = lock(&self.not_found_handler).clone();
                handler(&request, conn).await
            }
        }
    }

    fn find_service(&self, resource: &str) -> Option<ServiceRef> {
        let services = lock(&self.services);
        if services.is_empty() {
            return None;
        }
        // Walk candidate prefixes from the longest downward.
        for (registered, service) in services
            .range::<str, _>((Bound::Unbounded, Bound::Included(resource)))
            .rev()
        {
            if resource.starts_with(registered.as_str())
                && (resource.len() == registered.len()
                    || resource.as_bytes()[registered.len()] == b'/'
                    || registered.is_empty())
            {
                return Some(service.clone());
            }
        }
        None
    }
}

/// Strips one trailing slash from a resource. The root resource `/`
/// becomes the empty prefix, which matches everything.
pub fn strip_trailing_slash(resource: &str) -> &str {
    resource.strip_suffix('/').unwrap_or(resource)
}

/// Writes the canned `400 Bad Request` page and finishes the message.
pub async fn handle_bad_request(request: &HttpRequest, conn: &mut TcpConnection) -> Result<()> {
    static BAD_REQUEST_HTML: &str = "<html><head>\n\
        <title>400 Bad Request</title>\n\
        </head><body>\n\
        <h1>Bad Request</h1>\n\
        <p>Your browser sent a request that this server could not understand.</p>\n\
        </body></html>\n";
    let mut writer = ResponseWriter::new(request);
    writer.response_mut().set_status_code(400);
    writer.write_static(BAD_REQUEST_HTML);
    writer.send(conn).await.map(|_| ())
}

/// Writes the canned `404 Not Found` page.
pub async fn handle_not_found(request: &HttpRequest, conn: &mut TcpConnection) -> Result<()> {
    static NOT_FOUND_HTML_START: &str = "<html><head>\n\
        <title>404 Not Found</title>\n\
        </head><body>\n\
        <h1>Not Found</h1>\n\
        <p>The requested URL ";
    static NOT_FOUND_HTML_FINISH: &str = " was not found on this server.</p>\n\
        </body></html>\n";
    let mut writer = ResponseWriter::new(request);
    writer.response_mut().set_status_code(404);
    writer.write_static(NOT_FOUND_HTML_START);
    writer.write(request.resource());
    writer.write_static(NOT_FOUND_HTML_FINISH);
    writer.send(conn).await.map(|_| ())
}

/// Writes the canned `500 Server Error` page with a message.
pub async fn handle_server_error(
    request: &HttpRequest,
    conn: &mut TcpConnection,
    error_msg: &str,
) -> Result<()> {
    static SERVER_ERROR_HTML_START: &str = "<html><head>\n\
        <title>500 Server Error</title>\n\
        </head><body>\n\
        <h1>Internal Server Error</h1>\n\
        <p>The server encountered an internal error: <strong>";
    static SERVER_ERROR_HTML_FINISH: &str = "</strong></p>\n\
        </body></html>\n";
    let mut writer = ResponseWriter::new(request);
    writer.response_mut().set_status_code(500);
    writer.write_static(SERVER_ERROR_HTML_START);
    writer.write(error_msg);
    writer.write_static(SERVER_ERROR_HTML_FINISH);
    writer.send(conn).await.map(|_| ())
}

/// Writes the canned `403 Forbidden` page with a message.
pub async fn handle_forbidden(
    request: &HttpRequest,
    conn: &mut TcpConnection,
    error_msg: &str,
) -> Result<()> {
    static FORBIDDEN_HTML_START: &str = "<html><head>\n\
        <title>403 Forbidden</title>\n\
        </head><body>\n\
        <h1>Forbidden</h1>\n\
        <p>User not authorized to access the requested URL ";
    static FORBIDDEN_HTML_MIDDLE: &str = "</p><p><strong>\n";
    static FORBIDDEN_HTML_FINISH: &str = "</strong></p>\n\
        </body></html>\n";
    let mut writer = ResponseWriter::new(request);
    writer.response_mut().set_status_code(403);
    writer.write_static(FORBIDDEN_HTML_START);
    writer.write(request.resource());
    writer.write_static(FORBIDDEN_HTML_MIDDLE);
    writer.write(error_msg);
    writer.write_static(FORBIDDEN_HTML_FINISH);
    writer.send(conn).await.map(|_| ())
}

/// Writes the canned `405 Method Not Allowed` page with an `Allow`
/// header.
pub async fn handle_method_not_allowed(
    request: &HttpRequest,
    conn: &mut TcpConnection,
    allowed_methods: &str,
) -> Result<()> {
    static NOT_ALLOWED_HTML_START: &str = "<html><head>\n\
        <title>405 Method Not Allowed</title>\n\
        </head><body>\n\
        <h1>Not Allowed</h1>\n\
        <p>The requested method ";
    static NOT_ALLOWED_HTML_FINISH: &str = " is not allowed on this server.</p>\n\
        </body></html>\n";
    let mut writer = ResponseWriter::new(request);
    writer.response_mut().set_status_code(405);
    if !allowed_methods.is_empty() {
        writer
            .response_mut()
            .head_mut()
            .add_header("Allow", allowed_methods);
    }
    writer.write_static(NOT_ALLOWED_HTML_START);
    writer.write(request.method().as_str());
    writer.write_static(NOT_ALLOWED_HTML_FINISH);
    writer.send(conn).await.map(|_| ())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_trailing_slash_rules() {
        assert_eq!(strip_trailing_slash("/foo/"), "/foo");
        assert_eq!(strip_trailing_slash("/foo"), "/foo");
        assert_eq!(strip_trailing_slash("/"), "");
        assert_eq!(strip_trailing_slash(""), "");
    }

    #[test]
    fn prefix_matching_with_boundary() {
        struct Nop;
        impl WebService for Nop {
            fn handle<'a>(
                &'a self,
                _request: &'a HttpRequest,
                _conn: &'a mut TcpConnection,
            ) -> BoxFuture<'a, Result<bool>> {
                Box::pin(async { Ok(true) })
            }
        }

        let scheduler = Arc::new(Scheduler::new());
        let server = HttpServer::new(scheduler.clone(), "127.0.0.1:0".parse().unwrap());
        server.add_service("/foo", Arc::new(Nop));
        server.add_service("/foo/bar", Arc::new(Nop));

        assert!(server.find_service("/foo").is_some());
        assert!(server.find_service("/foo/bar").is_some());
        assert!(server.find_service("/foo/bar/baz").is_some());
        assert!(server.find_service("/foo/other").is_some());
        assert!(server.find_service("/foobar").is_none());
        assert!(server.find_service("/other").is_none());
        scheduler.shutdown();
    }

    #[test]
    fn trailing_slash_is_stripped_on_registration() {
        struct Nop;
        impl WebService for Nop {
            fn handle<'a>(
                &'a self,
                _request: &'a HttpRequest,
                _conn: &'a mut TcpConnection,
            ) -> BoxFuture<'a, Result<bool>> {
                Box::pin(async { Ok(true) })
            }
        }
        let scheduler = Arc::new(Scheduler::new());
        let server = HttpServer::new(scheduler.clone(), "127.0.0.1:0".parse().unwrap());
        server.add_service("/svc/", Arc::new(Nop));
        assert!(server.find_service("/svc").is_some());
        scheduler.shutdown();
    }
}
