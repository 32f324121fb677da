//! Cookie-keyed, server-side session state.
//!
//! Each client carries an opaque random token in the `cms_session` cookie. The
//! token keys a [`SessionData`] record held in memory. [`session_layer`] loads
//! the record before the handler runs, exposes it as a per-request [`Session`]
//! handle, and writes it back once the response is ready.
//!
//! Records expire after [`SESSION_TTL`] without a request and the store never
//! holds more than [`MAX_SESSIONS`] of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use rand::RngCore;
use tokio::sync::RwLock;

use crate::error::CmsError;

pub const SESSION_COOKIE: &str = "cms_session";

/// Idle time after which a session is forgotten.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on live sessions; the one closest to expiry is evicted first.
pub const MAX_SESSIONS: usize = 10_000;

/// Token length in random bytes (rendered as twice as many hex chars).
const TOKEN_BYTES: usize = 32;

/// Stored state for one client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionData {
    pub user: Option<String>,
    pub success: Option<String>,
    pub error: Option<String>,
}

struct Entry {
    data: SessionData,
    expires: Instant,
}

/// All live sessions, keyed by cookie token.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_limits(SESSION_TTL, MAX_SESSIONS)
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            sessions: Arc::default(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Look up a live session. An expired record is removed and reported as
    /// absent.
    pub async fn load(&self, token: &str) -> Option<SessionData> {
        let now = Instant::now();
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                Some(entry) if entry.expires > now => return Some(entry.data.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut sessions = self.sessions.write().await;
        if sessions.get(token).is_some_and(|e| e.expires <= now) {
            sessions.remove(token);
        }
        None
    }

    /// Store `data` under `token` and push its expiry out by the TTL.
    ///
    /// Adding a new token first drops every expired record, then evicts the
    /// oldest survivors while the store is full.
    pub async fn save(&self, token: String, data: SessionData) {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;

        if !sessions.contains_key(&token) {
            sessions.retain(|_, e| e.expires > now);
            while sessions.len() >= self.capacity {
                let Some(oldest) = sessions
                    .iter()
                    .min_by_key(|(_, e)| e.expires)
                    .map(|(t, _)| t.clone())
                else {
                    break;
                };
                tracing::debug!("session store full, evicting oldest session");
                sessions.remove(&oldest);
            }
        }

        sessions.insert(
            token,
            Entry {
                data,
                expires: now + self.ttl,
            },
        );
    }

    pub async fn remove(&self, token: &str) {
        self.sessions.write().await.remove(token);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[derive(Default)]
struct Inner {
    data: SessionData,
    rotate: bool,
}

/// Per-request handle on the current client's session.
///
/// Cloning shares the same underlying record, so the middleware and the
/// handler see each other's changes.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<Inner>>,
}

impl Session {
    pub fn new(data: SessionData) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data,
                rotate: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn user(&self) -> Option<String> {
        self.lock().data.user.clone()
    }

    /// Mark the client as signed in. The session token is replaced when the
    /// response goes out.
    pub fn sign_in(&self, user: impl Into<String>) {
        let mut state = self.lock();
        state.data.user = Some(user.into());
        state.rotate = true;
    }

    pub fn sign_out(&self) {
        self.lock().data.user = None;
    }

    pub fn set_success(&self, message: impl Into<String>) {
        self.lock().data.success = Some(message.into());
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.lock().data.error = Some(message.into());
    }

    /// Return the pending success message and clear it.
    pub fn take_success(&self) -> Option<String> {
        self.lock().data.success.take()
    }

    /// Return the pending error message and clear it.
    pub fn take_error(&self) -> Option<String> {
        self.lock().data.error.take()
    }

    pub fn snapshot(&self) -> SessionData {
        self.lock().data.clone()
    }

    fn take_rotate(&self) -> bool {
        std::mem::take(&mut self.lock().rotate)
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = CmsError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or(CmsError::SessionMissing)
    }
}

/// Middleware: attach the client's session to the request and persist it
/// after the handler has run.
///
/// Unknown or expired tokens are never adopted; the client gets a fresh one
/// instead. A fresh session is only stored (and its cookie issued) once it
/// holds data. Signing in always moves the session to a new token.
pub async fn session_layer(
    State(store): State<SessionStore>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Response {
    let existing = match session_token(&jar) {
        Some(token) => store.load(&token).await.map(|data| (token, data)),
        None => None,
    };
    let (mut token, data, mut fresh) = match existing {
        Some((token, data)) => (token, data, false),
        None => (new_token(), SessionData::default(), true),
    };

    let session = Session::new(data);
    req.extensions_mut().insert(session.clone());

    let resp = next.run(req).await;

    let data = session.snapshot();
    // Anonymous visitors with nothing to remember get no session at all.
    if fresh && data == SessionData::default() {
        return resp;
    }
    if session.take_rotate() && !fresh {
        store.remove(&token).await;
        token = new_token();
        fresh = true;
        tracing::debug!("rotated session token");
    }
    store.save(token.clone(), data).await;

    if !fresh {
        return resp;
    }
    tracing::debug!("issued new session");
    (jar.add(session_cookie(token)), resp).into_response()
}

/// The session token carried by the request, if any.
pub fn session_token(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE)
        .map(|c| c.value().to_owned())
        .filter(|token| !token.is_empty())
}

fn session_cookie(token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build()
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
