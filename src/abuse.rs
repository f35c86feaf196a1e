//! Anti-abuse protection for the WebSocket endpoint
//!
//! Two layers, both configurable from the environment:
//! - HTTP middleware refusing the upgrade to listed user agents
//! - A per-connection inbound frame limiter applied by the gateway

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

pub const DEFAULT_RATE_LIMIT_MAX: u32 = 40;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 5;
pub const DEFAULT_BLOCKED_AGENTS: &[&str] =
    &["curl", "wget", "python-requests", "crawler", "spider"];

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    frames: u32,
}

/// Fixed-window frame counter keyed by connection
#[derive(Debug, Clone)]
pub struct RateLimiter {
    windows: Arc<RwLock<HashMap<String, Window>>>,
    max_frames: u32,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(
            DEFAULT_RATE_LIMIT_MAX,
            Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
        )
    }
}

impl RateLimiter {
    pub fn new(max_frames: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(RwLock::new(HashMap::new())),
            max_frames,
            window,
        }
    }

    /// Count one frame for `key`; false once the window's budget is spent
    pub async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.write().await;

        let Some(current) = windows.get_mut(key) else {
            windows.insert(
                key.to_string(),
                Window {
                    started: now,
                    frames: 1,
                },
            );
            return true;
        };

        if now.duration_since(current.started) >= self.window {
            *current = Window {
                started: now,
                frames: 0,
            };
        }
        if current.frames >= self.max_frames {
            return false;
        }
        current.frames += 1;
        true
    }

    /// Drop the counter for a connection that has closed
    pub async fn forget(&self, key: &str) {
        self.windows.write().await.remove(key);
    }

    /// Drop counters whose window ended a while ago (call periodically)
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let horizon = self.window * 2;
        self.windows
            .write()
            .await
            .retain(|_, w| now.duration_since(w.started) < horizon);
    }
}

/// Anti-abuse configuration
#[derive(Debug, Clone)]
pub struct AbuseConfig {
    /// Lowercase fragments; a User-Agent containing one is refused.
    /// Requests without a User-Agent are let through.
    pub blocked_agents: Vec<String>,
    /// Per-connection inbound frame limiter (None = disabled)
    pub rate_limiter: Option<RateLimiter>,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            blocked_agents: DEFAULT_BLOCKED_AGENTS
                .iter()
                .map(|agent| agent.to_string())
                .collect(),
            rate_limiter: Some(RateLimiter::default()),
        }
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(default)
}

/// Split a comma-separated agent list; blank entries are skipped
fn parse_agents(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|agent| agent.trim().to_lowercase())
        .filter(|agent| !agent.is_empty())
        .collect()
}

impl AbuseConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let blocked_agents = match std::env::var("ABUSE_BLOCKED_AGENTS") {
            Ok(raw) => parse_agents(&raw),
            Err(_) => Self::default().blocked_agents,
        };
        let rate_limit_enabled = env_flag("ABUSE_RATE_LIMIT", true);

        let rate_limiter = rate_limit_enabled.then(|| {
            let max_frames = std::env::var("ABUSE_RATE_LIMIT_MAX")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX);

            let window_secs = std::env::var("ABUSE_RATE_LIMIT_WINDOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);

            RateLimiter::new(max_frames, Duration::from_secs(window_secs))
        });

        tracing::info!(
            blocked_agents = ?blocked_agents,
            rate_limit_enabled,
            "Anti-abuse config loaded"
        );

        Self {
            blocked_agents,
            rate_limiter,
        }
    }

    /// The listed fragment this User-Agent matches, if any
    pub fn blocked_agent(&self, user_agent: &str) -> Option<&str> {
        let user_agent = user_agent.to_lowercase();
        self.blocked_agents
            .iter()
            .find(|fragment| user_agent.contains(fragment.as_str()))
            .map(String::as_str)
    }
}

fn forbidden(message: &'static str) -> Response<Body> {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/plain")],
        message,
    )
        .into_response()
}

/// Middleware for anti-abuse protection on the WebSocket endpoint
pub async fn ws_abuse_middleware(
    State(config): State<Arc<AbuseConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|ua| ua.to_str().ok());

    if let Some(ua) = user_agent {
        if let Some(fragment) = config.blocked_agent(ua) {
            tracing::warn!(user_agent = ua, fragment, "Refused blocked user agent");
            return forbidden("Access denied");
        }
    }

    next.run(request).await
}
