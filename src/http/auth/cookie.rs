//! Session-cookie authentication with a TTL'd user cache.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::Auth;
use crate::http::auth::{lock, Authenticator, User, UserManager};
use crate::http::request::HttpRequest;
use crate::http::server::{handle_forbidden, strip_trailing_slash};
use crate::http::url_decode;
use crate::http::writer::ResponseWriter;
use crate::tcp::TcpConnection;
use crate::{Error, Result};

/// Name of the session cookie.
pub const AUTH_COOKIE_NAME: &str = "pion_session_id";

/// Seconds an idle session survives in the cache.
pub const CACHE_EXPIRATION: u64 = 3600;

const RANDOM_COOKIE_BYTES: usize = 20;

struct SessionCache {
    entries: HashMap<String, (SystemTime, Arc<User>)>,
    cleanup_time: SystemTime,
    expiration: Duration,
}

/// Cookie-based authenticator.
///
/// A `GET <login>?user=..&pass=..` with valid credentials issues a
/// random session cookie; `<logout>` revokes it. Every other request
/// must present the cookie, which refreshes its idle timer. Expired
/// entries are swept once per expiration period.
///
/// Resources may additionally be restricted to named users with
/// [`restrict_resource`](CookieAuth::restrict_resource): a valid
/// session for anyone else is refused with a 403 rather than the 401
/// challenge an unauthenticated request gets.
pub struct CookieAuth {
    user_manager: Arc<UserManager>,
    login: Mutex<String>,
    logout: Mutex<String>,
    redirect: Mutex<String>,
    cache: Mutex<SessionCache>,
    rng: Mutex<StdRng>,
    /// Resource prefixes only the listed usernames may access.
    restricted: Mutex<Vec<(String, HashSet<String>)>>,
}

impl std::fmt::Debug for CookieAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieAuth")
            .field("login", &*lock(&self.login))
            .field("logout", &*lock(&self.logout))
            .field("sessions", &lock(&self.cache).entries.len())
            .finish()
    }
}

impl CookieAuth {
    /// Creates an authenticator with the given login/logout resources
    /// and optional redirect page (empty string for 401 challenges).
    pub fn new(
        user_manager: Arc<UserManager>,
        login: &str,
        logout: &str,
        redirect: &str,
    ) -> CookieAuth {
        // Seeded once from the wall clock; warmed before first use.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..100 {
            let _: u8 = rng.gen();
        }
        CookieAuth {
            user_manager,
            login: Mutex::new(login.to_string()),
            logout: Mutex::new(logout.to_string()),
            redirect: Mutex::new(redirect.to_string()),
            cache: Mutex::new(SessionCache {
                entries: HashMap::new(),
                cleanup_time: SystemTime::now(),
                expiration: Duration::from_secs(CACHE_EXPIRATION),
            }),
            rng: Mutex::new(rng),
            restricted: Mutex::new(Vec::new()),
        }
    }

    /// Restricts a resource subtree to the named users. The same
    /// prefix-and-boundary rule as service dispatch applies, and the
    /// longest matching restriction wins.
    pub fn restrict_resource(&self, resource: &str, usernames: &[&str]) {
        let clean = strip_trailing_slash(resource).to_string();
        let users: HashSet<String> = usernames.iter().map(|u| (*u).to_string()).collect();
        let mut restricted = lock(&self.restricted);
        restricted.retain(|(prefix, _)| *prefix != clean);
        restricted.push((clean, users));
    }

    /// Checks the restriction list for a resource; unrestricted
    /// resources permit everyone.
    fn permitted(&self, resource: &str, username: &str) -> bool {
        let restricted = lock(&self.restricted);
        let mut matched: Option<&HashSet<String>> = None;
        let mut matched_len = 0;
        for (prefix, users) in restricted.iter() {
            let on_boundary = resource.len() == prefix.len()
                || prefix.is_empty()
                || resource.as_bytes().get(prefix.len()) == Some(&b'/');
            if resource.starts_with(prefix.as_str())
                && on_boundary
                && (matched.is_none() || prefix.len() > matched_len)
            {
                matched = Some(users);
                matched_len = prefix.len();
            }
        }
        match matched {
            Some(users) => users.contains(username),
            None => true,
        }
    }

    /// Overrides the session idle expiration.
    pub fn set_cache_expiration(&self, expiration: Duration) {
        lock(&self.cache).expiration = expiration;
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        lock(&self.cache).entries.len()
    }

    fn random_cookie(&self) -> String {
        let mut bytes = [0u8; RANDOM_COOKIE_BYTES];
        lock(&self.rng).fill(&mut bytes[..]);
        BASE64.encode(bytes)
    }

    /// Sweeps expired sessions, at most once per expiration period.
    fn expire_cache(&self, now: SystemTime) {
        let mut cache = lock(&self.cache);
        let expiration = cache.expiration;
        if now > cache.cleanup_time + expiration {
            cache
                .entries
                .retain(|_, (last_access, _)| now <= *last_access + expiration);
            cache.cleanup_time = now;
        }
    }

    /// Looks up the presented session cookie, refreshing its timer.
    fn check_session(&self, request: &HttpRequest, now: SystemTime) -> Result<Arc<User>> {
        let cookie = request
            .cookie(AUTH_COOKIE_NAME)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::new_auth(Auth::NoCookie))?;
        let mut cache = lock(&self.cache);
        match cache.entries.get_mut(cookie) {
            Some(entry) => {
                entry.0 = now;
                Ok(entry.1.clone())
            }
            None => Err(Error::new_auth(Auth::Expired)),
        }
    }

    /// Handles login/logout resources. Returns true when the request
    /// was one of them and a response has been written.
    async fn process_login(
        &self,
        request: &HttpRequest,
        conn: &mut TcpConnection,
    ) -> Result<bool> {
        let resource = strip_trailing_slash(request.resource()).to_string();
        let is_login = resource == *lock(&self.login);
        let is_logout = resource == *lock(&self.logout);
        if !is_login && !is_logout {
            return Ok(false);
        }

        let redirect_url = request.query("url").map(url_decode).unwrap_or_default();
        let mut new_cookie = String::new();
        let mut delete_cookie = false;

        if is_login {
            let username = request.query("user").map(url_decode).unwrap_or_default();
            let password = request.query("pass").map(url_decode).unwrap_or_default();
            match self.user_manager.user(&username, &password) {
                Some(user) => {
                    new_cookie = self.random_cookie();
                    let now = SystemTime::now();
                    lock(&self.cache)
                        .entries
                        .insert(new_cookie.clone(), (now, user));
                }
                None => {
                    debug!(user = %username, "login failed");
                    self.handle_unauthorized(request, conn).await?;
                    return Ok(true);
                }
            }
        } else {
            // Logout: drop the presented session, if any.
            if let Some(cookie) = request.cookie(AUTH_COOKIE_NAME) {
                lock(&self.cache).entries.remove(cookie);
            }
            delete_cookie = true;
        }

        if redirect_url.is_empty() {
            self.handle_ok(request, conn, &new_cookie, delete_cookie)
                .await?;
        } else {
            self.handle_redirection(request, conn, &redirect_url, &new_cookie, delete_cookie)
                .await?;
        }
        Ok(true)
    }

    async fn handle_unauthorized(
        &self,
        request: &HttpRequest,
        conn: &mut TcpConnection,
    ) -> Result<()> {
        let redirect = lock(&self.redirect).clone();
        if !redirect.is_empty() {
            return self
                .handle_redirection(request, conn, &redirect, "", false)
                .await;
        }
        static CONTENT: &str = " <!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.01 Transitional//EN\"\
            \"http://www.w3.org/TR/1999/REC-html401-19991224/loose.dtd\">\
            <HTML>\
            <HEAD>\
            <TITLE>Error</TITLE>\
            <META HTTP-EQUIV=\"Content-Type\" CONTENT=\"text/html; charset=ISO-8859-1\">\
            </HEAD>\
            <BODY><H1>401 Unauthorized.</H1></BODY>\
            </HTML> ";
        let mut writer = ResponseWriter::new(request);
        writer.response_mut().set_status_code(401);
        writer.write_static(CONTENT);
        writer.send(conn).await.map(|_| ())
    }

    async fn handle_redirection(
        &self,
        request: &HttpRequest,
        conn: &mut TcpConnection,
        redirection_url: &str,
        new_cookie: &str,
        delete_cookie: bool,
    ) -> Result<()> {
        static CONTENT: &str = " <!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.01 Transitional//EN\"\
            \"http://www.w3.org/TR/1999/REC-html401-19991224/loose.dtd\">\
            <HTML>\
            <HEAD>\
            <TITLE>Redirect</TITLE>\
            <META HTTP-EQUIV=\"Content-Type\" CONTENT=\"text/html; charset=ISO-8859-1\">\
            </HEAD>\
            <BODY><H1>302 Found.</H1></BODY>\
            </HTML> ";
        let mut writer = ResponseWriter::new(request);
        writer.response_mut().set_status_code(302);
        writer
            .response_mut()
            .head_mut()
            .add_header("Location", redirection_url);
        // An empty path works around browser differences; the cookie
        // is assumed to apply from the site root.
        if delete_cookie {
            writer.response_mut().delete_cookie(AUTH_COOKIE_NAME, "");
        } else if !new_cookie.is_empty() {
            writer
                .response_mut()
                .set_cookie(AUTH_COOKIE_NAME, new_cookie, "");
        }
        writer.write_static(CONTENT);
        writer.send(conn).await.map(|_| ())
    }

    async fn handle_ok(
        &self,
        request: &HttpRequest,
        conn: &mut TcpConnection,
        new_cookie: &str,
        delete_cookie: bool,
    ) -> Result<()> {
        let mut writer = ResponseWriter::new(request);
        writer.response_mut().set_status_code(204);
        if delete_cookie {
            writer.response_mut().delete_cookie(AUTH_COOKIE_NAME, "");
        } else if !new_cookie.is_empty() {
            writer
                .response_mut()
                .set_cookie(AUTH_COOKIE_NAME, new_cookie, "");
        }
        writer.send(conn).await.map(|_| ())
    }
}

impl Authenticator for CookieAuth {
    fn handle<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        conn: &'a mut TcpConnection,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.process_login(request, conn).await? {
                // Login or logout was handled; no dispatch follows.
                return Ok(false);
            }

            let resource = strip_trailing_slash(request.resource()).to_string();
            let redirect = lock(&self.redirect).clone();
            if !redirect.is_empty() && redirect == resource {
                // The redirection target itself must stay reachable.
                return Ok(true);
            }

            let now = SystemTime::now();
            self.expire_cache(now);
            match self.check_session(request, now) {
                Ok(user) => {
                    // Authenticated, but possibly not authorized for
                    // this resource.
                    if !self.permitted(&resource, user.username()) {
                        debug!(
                            user = user.username(),
                            resource = %resource,
                            "user is not permitted for resource"
                        );
                        handle_forbidden(
                            request,
                            conn,
                            "user is not permitted to access this resource",
                        )
                        .await?;
                        return Ok(false);
                    }
                    request.set_user(user);
                    Ok(true)
                }
                Err(e) => {
                    debug!(error = %e, "authentication refused");
                    self.handle_unauthorized(request, conn).await?;
                    Ok(false)
                }
            }
        })
    }

    fn set_option(&self, name: &str, value: &str) -> Result<()> {
        match name {
            "login" => *lock(&self.login) = value.to_string(),
            "logout" => *lock(&self.logout) = value.to_string(),
            "redirect" => *lock(&self.redirect) = value.to_string(),
            _ => return Err(Error::new_config(format!("unknown auth option: {name}"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> CookieAuth {
        let users = Arc::new(UserManager::new());
        users.add_user("mike", "secret");
        CookieAuth::new(users, "/login", "/logout", "")
    }

    fn request_with_cookie(cookie: &str) -> HttpRequest {
        let mut request = HttpRequest::new();
        request.set_resource("/private");
        request
            .cookies_mut()
            .insert(AUTH_COOKIE_NAME.to_string(), cookie.to_string());
        request
    }

    #[test]
    fn random_cookies_are_base64_of_twenty_bytes(){
        let auth = auth();
        let cookie = auth.random_cookie();
        let decoded = BASE64.decode(cookie.as_bytes()).unwrap();
        assert_eq!(decoded.len(), RANDOM_COOKIE_BYTES);
        assert_ne!(auth.random_cookie(), auth.random_cookie());
    }

    #[test]
    fn session_hit_refreshes_timestamp() {
        let auth = auth();
        let user = auth.user_manager.user("mike", "secret").unwrap();
        let start = SystemTime::now() - Duration::from_secs(10);
        lock(&auth.cache)
            .entries
            .insert("abc".to_string(), (start, user));

        let request = request_with_cookie("abc");
        let now = SystemTime::now();
        auth.check_session(&request, now).unwrap();
        let stamped = lock(&auth.cache).entries.get("abc").unwrap().0;
        assert_eq!(stamped, now);
    }

    #[test]
    fn missing_cookie_and_unknown_cookie_refused() {
        let auth = auth();
        let now = SystemTime::now();
        let no_cookie = HttpRequest::new();
        assert!(auth.check_session(&no_cookie, now).unwrap_err().is_auth());
        let unknown = request_with_cookie("nope");
        assert!(auth.check_session(&unknown, now).unwrap_err().is_auth());
    }

    #[test]
    fn eviction_scan_removes_idle_sessions() {
        let auth = auth();
        let user = auth.user_manager.user("mike", "secret").unwrap();
        let expiration = Duration::from_secs(CACHE_EXPIRATION);
        let now = SystemTime::now();

        {
            let mut cache = lock(&auth.cache);
            // One idle past the deadline, one still fresh.
            cache
                .entries
                .insert("old".into(), (now - expiration - Duration::from_secs(1), user.clone()));
            cache.entries.insert("fresh".into(), (now, user));
            cache.cleanup_time = now - expiration - Duration::from_secs(1);
        }

        auth.expire_cache(now);
        let cache = lock(&auth.cache);
        assert!(!cache.entries.contains_key("old"));
        assert!(cache.entries.contains_key("fresh"));
        assert_eq!(cache.cleanup_time, now);
    }

    #[test]
    fn resource_restrictions_check_usernames() {
        let auth = auth();
        auth.restrict_resource("/admin", &["root"]);

        // Unrestricted resources permit everyone.
        assert!(auth.permitted("/private", "mike"));
        // Restricted subtrees only permit the listed users, matching
        // at path boundaries.
        assert!(!auth.permitted("/admin", "mike"));
        assert!(!auth.permitted("/admin/panel", "mike"));
        assert!(auth.permitted("/admin", "root"));
        assert!(auth.permitted("/administrator", "mike"));

        // The longest matching restriction wins, and re-restricting a
        // resource replaces the previous list.
        auth.restrict_resource("/admin/reports", &["root", "mike"]);
        assert!(auth.permitted("/admin/reports", "mike"));
        assert!(!auth.permitted("/admin/secrets", "mike"));
        auth.restrict_resource("/admin", &["mike"]);
        assert!(auth.permitted("/admin", "mike"));
        assert!(!auth.permitted("/admin", "root"));
    }

    #[test]
    fn eviction_scan_waits_for_deadline() {
        let auth = auth();
        let user = auth.user_manager.user("mike", "secret").unwrap();
        let expiration = Duration::from_secs(CACHE_EXPIRATION);
        let now = SystemTime::now();
        {
            let mut cache = lock(&auth.cache);
            cache
                .entries
                .insert("old".into(), (now - expiration - Duration::from_secs(1), user));
            // The periodic deadline has not been reached yet.
            cache.cleanup_time = now - Duration::from_secs(1);
        }
        auth.expire_cache(now);
        assert!(lock(&auth.cache).entries.contains_key("old"));
    }
}
