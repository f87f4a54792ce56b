//! Request authentication: user store and authenticator hooks.

mod basic;
mod cookie;

pub use self::basic::BasicAuth;
pub use self::cookie::{CookieAuth, AUTH_COOKIE_NAME};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::BoxFuture;

use crate::http::request::HttpRequest;
use crate::tcp::TcpConnection;
use crate::{Error, Result};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    username: String,
    password: String,
}

impl User {
    /// Creates a user with a plain-text password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> User {
        User {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The user's name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Checks a password attempt.
    pub fn matches_password(&self, attempt: &str) -> bool {
        self.password == attempt
    }
}

/// An in-memory credential store.
#[derive(Debug, Default)]
pub struct UserManager {
    users: Mutex<HashMap<String, Arc<User>>>,
}

impl UserManager {
    /// Creates an empty store.
    pub fn new() -> UserManager {
        UserManager::default()
    }

    /// Adds (or replaces) a user.
    pub fn add_user(&self, username: &str, password: &str) {
        lock(&self.users).insert(
            username.to_string(),
            Arc::new(User::new(username, password)),
        );
    }

    /// Removes a user; true if one was registered.
    pub fn remove_user(&self, username: &str) -> bool {
        lock(&self.users).remove(username).is_some()
    }

    /// Returns the user when the username/password pair is valid.
    pub fn user(&self, username: &str, password: &str) -> Option<Arc<User>> {
        lock(&self.users)
            .get(username)
            .filter(|user| user.matches_password(password))
            .cloned()
    }
}

/// Authentication hook consulted by the HTTP server before dispatch.
///
/// Returning `Ok(false)` means the authenticator has already written a
/// response (a challenge, redirect, or login acknowledgment) and the
/// request must not be dispatched.
pub trait Authenticator: Send + Sync {
    /// Authenticates one request, possibly writing a response.
    fn handle<'a>(
        &'a self,
        request: &'a mut HttpRequest,
        conn: &'a mut TcpConnection,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Sets a named configuration option.
    fn set_option(&self, name: &str, value: &str) -> Result<()> {
        let _ = value;
        Err(Error::new_config(format!("unknown auth option: {name}")))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
