//! Foreground progress gate.
//!
//! The HTTP layer asks the gate whether a request deserves a visible busy
//! indicator. The health monitor suspends the gate while the backend is
//! known to be down or the client is offline, so a struggling backend does
//! not keep a progress bar spinning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Delay before a tracked request makes the indicator visible.
pub const START_DELAY: Duration = Duration::from_millis(250);

/// What the gate needs to know about an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub method: http::Method,
    pub path: String,
    /// Explicitly marked as background traffic.
    pub silent: bool,
}

impl RequestMeta {
    pub fn new(method: http::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            silent: false,
        }
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    fn is_user_action(&self) -> bool {
        matches!(
            self.method,
            http::Method::POST | http::Method::PUT | http::Method::PATCH | http::Method::DELETE
        )
    }
}

/// In-flight count and the moment it last left zero, updated together.
#[derive(Debug, Default)]
struct Busy {
    inflight: usize,
    since: Option<Instant>,
}

#[derive(Debug)]
struct GateInner {
    suspended: AtomicBool,
    busy: Mutex<Busy>,
    health_path: String,
}

/// Shared progress gate. Clones share state.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    inner: Arc<GateInner>,
}

impl ProgressGate {
    pub fn new(health_path: &str) -> Self {
        Self {
            inner: Arc::new(GateInner {
                suspended: AtomicBool::new(false),
                busy: Mutex::new(Busy::default()),
                health_path: normalize_path(health_path),
            }),
        }
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.inner.suspended.store(suspended, Ordering::Relaxed);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Relaxed)
    }

    /// Whether `path` addresses the health endpoint.
    pub fn is_health_path(&self, path: &str) -> bool {
        let path = normalize_path(path);
        !path.is_empty() && (path == self.inner.health_path || path.ends_with(&self.inner.health_path))
    }

    /// Whether a request should drive the busy indicator.
    pub fn should_track(&self, req: &RequestMeta) -> bool {
        req.is_user_action()
            && !self.is_health_path(&req.path)
            && !req.silent
            && !self.is_suspended()
    }

    /// Start tracking `req`. Returns `None` for untracked requests.
    pub fn begin(&self, req: &RequestMeta) -> Option<ProgressGuard> {
        if !self.should_track(req) {
            return None;
        }
        let mut busy = lock(&self.inner.busy);
        if busy.inflight == 0 {
            busy.since = Some(Instant::now());
        }
        busy.inflight += 1;
        drop(busy);
        Some(ProgressGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn inflight(&self) -> usize {
        lock(&self.inner.busy).inflight
    }

    /// Whether the indicator should be on screen at `now`.
    pub fn indicator_visible(&self, now: Instant) -> bool {
        lock(&self.inner.busy)
            .since
            .is_some_and(|since| now.saturating_duration_since(since) >= START_DELAY)
    }
}

/// Keeps one tracked request counted until dropped.
#[derive(Debug)]
pub struct ProgressGuard {
    inner: Arc<GateInner>,
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        let mut busy = lock(&self.inner.busy);
        busy.inflight = busy.inflight.saturating_sub(1);
        if busy.inflight == 0 {
            busy.since = None;
        }
    }
}

fn lock(m: &Mutex<Busy>) -> std::sync::MutexGuard<'_, Busy> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Strip query, fragment and trailing slashes. Relative paths are rooted.
fn normalize_path(raw: &str) -> String {
    let without_query = raw.split(['?', '#']).next().unwrap_or_default();
    let path = match without_query.parse::<http::Uri>() {
        Ok(uri) if uri.scheme().is_some() => uri.path().to_string(),
        _ => without_query.to_string(),
    };
    let path = path.trim_end_matches('/');
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
