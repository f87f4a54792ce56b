//! HTTP Basic authentication with a TTL'd credential cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use tracing::debug;

use crate::error::Auth;
use crate::http::auth::{lock, Authenticator, User, UserManager};
use crate::http::request::HttpRequest;
use crate::http::writer::ResponseWriter;
use crate::tcp::TcpConnection;
use crate::{Error, Result};

/// Seconds a validated credential stays cached before it is checked
/// against the user store again.
pub const CACHE_EXPIRATION: u64 = 300;

struct CredentialCache {
    entries: HashMap<String, (SystemTime, Arc<User>)>,
    cleanup_time: SystemTime,
    expiration: Duration,
}

/// `Authorization: Basic` authenticator.
pub struct BasicAuth {
    user_manager: Arc<UserManager>,
    realm: Mutex<String>,
    cache: Mutex<CredentialCache>,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("realm", &*lock(&self.realm))
            .finish()
    }
}

impl BasicAuth {
    /// Creates an authenticator for the given realm.
    pub fn new(user_manager: Arc<UserManager>, realm: &str) -> BasicAuth {
        BasicAuth {
            user_manager,
            realm: Mutex::new(realm.to_string()),
            cache: Mutex::new(CredentialCache {
                entries: HashMap::new(),
                cleanup_time: SystemTime::now(),
                expiration: Duration::from_secs(CACHE_EXPIRATION),
            }),
        }
    }

    /// Overrides the credential cache expiration.
    pub fn set_cache_expiration(&self, expiration: Duration) {
        lock(&self.cache).expiration = expiration;
    }

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

    fn check_credentials(&self, request: &HttpRequest, now: SystemTime) -> Result<Arc<User>> {
        let header = request
            .head()
            .header("authorization")
            .ok_or_else(|| Error::new_auth(Auth::NoCookie))?;
        let credentials = header
            .strip_prefix("Basic ")
            .ok_or_else(|| Error::new_auth(Auth::BadCredentials))?
            .trim()
            .to_string();

        {
            let mut cache = lock(&self.cache);
            if let Some(entry) = cache.entries.get_mut(&credentials) {
                entry.0 = now;
                return Ok(entry.1.clone());
            }
        }

        let decoded = BASE64
            .decode(credentials.as_bytes())
            .map_err(|_| Error::new_auth(Auth::BadCredentials))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| Error::new_auth(Auth::BadCredentials))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| Error::new_auth(Auth::BadCredentials))?;
        let user = self
            .user_manager
            .user(username, password)
            .ok_or_else(|| Error::new_auth(Auth::BadCredentials))?;

        lock(&self.cache)
            .entries
            .insert(credentials, (now, user.clone()));
        Ok(user)
    }

    async fn handle_unauthorized(
        &self,
        request: &HttpRequest,
        conn: &mut TcpConnection,
    ) -> Result<()> {
        static CONTENT: &str = " <!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.01 Transitional//EN\"\
            \"http://www.w3.org/TR/1999/REC-html401-19991224/loose.dtd\">\
            <HTML>\
            <HEAD>\
            <TITLE>Error</TITLE>\
            <META HTTP-EQUIV=\"Content-Type\" CONTENT=\"text/html; charset=ISO-8859-1\">\
            </HEAD>\
            <BODY><H1>401 Unauthorized.</H1></BODY>\
            </HTML> ";
        let realm = lock(&self.realm).clone();
        let mut writer = ResponseWriter::new(request);
        writer.response_mut().set_status_code(401);
        writer
            .response_mut()
            .head_mut()
            .add_header("WWW-Authenticate", &format!("Basic realm=\"{realm}\""));
        writer.write_static(CONTENT);
        writer.send(conn).await.map(|_| ())
    }
}

impl Authenticator for BasicAuth {
    fn handle<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        conn: &'a mut TcpConnection,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let now = SystemTime::now();
            self.expire_cache(now);
            match self.check_credentials(request, now) {
                Ok(user) => {
                    request.set_user(user);
                    Ok(true)
                }
                Err(e) => {
                    debug!(error = %e, "basic authentication refused");
                    self.handle_unauthorized(request, conn).await?;
                    Ok(false)
                }
            }
        })
    }

    fn set_option(&self, name: &str, value: &str) -> Result<()> {
        match name {
            "realm" => *lock(&self.realm) = value.to_string(),
            _ => return Err(Error::new_config(format!("unknown auth option: {name}"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> BasicAuth {
        let users = Arc::new(UserManager::new());
        users.add_user("mike", "secret");
        BasicAuth::new(users, "pion")
    }

    fn request_with_auth(value: &str) -> HttpRequest {
        let mut request = HttpRequest::new();
        request.set_resource("/private");
        request.head_mut().add_header("Authorization", value);
        request
    }

    #[test]
    fn valid_credentials_accepted_and_cached() {
        let auth = auth();
        let encoded = BASE64.encode(b"mike:secret");
        let request = request_with_auth(&format!("Basic {encoded}"));
        let now = SystemTime::now();
        let user = auth.check_credentials(&request, now).unwrap();
        assert_eq!(user.username(), "mike");
        assert_eq!(lock(&auth.cache).entries.len(), 1);

        // A second check hits the cache even if the store changes.
        auth.user_manager.remove_user("mike");
        auth.check_credentials(&request, now).unwrap();
    }

    #[test]
    fn malformed_headers_refused() {
        let auth = auth();
        let now = SystemTime::now();
        let no_colon = format!("Basic {}", BASE64.encode(b"no-colon"));
        let wrong_password = format!("Basic {}", BASE64.encode(b"mike:wrong"));
        for value in [
            "Bearer abc",
            "Basic !!!not-base64!!!",
            no_colon.as_str(),
            wrong_password.as_str(),
        ] {
            let request = request_with_auth(value);
            assert!(auth.check_credentials(&request, now).unwrap_err().is_auth());
        }
        let no_header = HttpRequest::new();
        assert!(auth.check_credentials(&no_header, now).unwrap_err().is_auth());
    }
}
