//! Pending authorization-code flows.
//!
//! The CSRF `state` travels in a provider-keyed cookie; the server keeps
//! `{state, original_url, provider}` until the callback takes it. Entries are single
//! use and expire after `ttl`.

use axum::http::{HeaderMap, HeaderValue, header::InvalidHeaderValue};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

use crate::session::cookie::extract_cookie;

pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(600);
const STATE_COOKIE_PREFIX: &str = "tg_oauth_state_";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthFlowState {
    pub state: String,
    pub original_url: String,
    pub provider: String,
}

struct PendingFlow {
    flow: OAuthFlowState,
    created_at: Instant,
}

pub struct FlowStateStore {
    ttl: Duration,
    pending: Mutex<HashMap<String, PendingFlow>>,
}

impl Default for FlowStateStore {
    fn default() -> Self {
        Self::new(DEFAULT_FLOW_TTL)
    }
}

impl FlowStateStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn store(&self, flow: OAuthFlowState) {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, entry| entry.created_at.elapsed() < self.ttl);
        pending.insert(
            flow.state.clone(),
            PendingFlow {
                flow,
                created_at: Instant::now(),
            },
        );
    }

    /// Remove the entry for `state` and return it if it is fresh and was issued for
    /// `provider`. The entry is gone afterwards either way.
    pub async fn take(&self, provider: &str, state: &str) -> Option<OAuthFlowState> {
        let mut pending = self.pending.lock().await;
        if let Some(entry) = pending.remove(state)
            && entry.created_at.elapsed() < self.ttl
            && entry.flow.provider == provider
        {
            Some(entry.flow)
        } else {
            None
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[must_use]
pub fn state_cookie_name(provider: &str) -> String {
    format!("{STATE_COOKIE_PREFIX}{provider}")
}

#[must_use]
pub fn extract_state_cookie(headers: &HeaderMap, provider: &str) -> Option<String> {
    extract_cookie(headers, &state_cookie_name(provider))
}

/// Scoped to the provider callback path so it is only replayed there.
pub fn state_cookie(
    provider: &str,
    state: &str,
    ttl: Duration,
    secure: bool,
) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}={state}; Path=/auth/callback/{provider}; HttpOnly; SameSite=Lax; Max-Age={}",
        state_cookie_name(provider),
        ttl.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}

pub fn clear_state_cookie(provider: &str, secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
    let mut cookie = format!(
        "{}=; Path=/auth/callback/{provider}; HttpOnly; SameSite=Lax; Max-Age=0",
        state_cookie_name(provider)
    );
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
}
