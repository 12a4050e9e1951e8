//! HTTP Basic: a username/password pair on every request, no session.

use axum::http::{HeaderMap, HeaderValue, header::AUTHORIZATION, request::Parts};
use base64::Engine;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

use super::{AuthRejection, AuthenticatedIdentity, password::spawn_verify};
use crate::{middleware::RequestContext, store::UserRepository};

pub const BASIC_SOURCE: &str = "basic";
pub const DEFAULT_FAILURE_DELAY: Duration = Duration::from_secs(1);
const CHALLENGE: &str = "Basic realm=\"tollgate\", charset=\"UTF-8\"";

pub struct BasicAuthenticator {
    users: Arc<dyn UserRepository>,
    failure_delay: Duration,
}

impl BasicAuthenticator {
    #[must_use]
    pub fn new(users: Arc<dyn UserRepository>, failure_delay: Duration) -> Self {
        Self {
            users,
            failure_delay,
        }
    }

    /// # Errors
    /// `Unauthorized` with a Basic challenge, after the fixed failure delay.
    pub async fn authenticate(
        &self,
        parts: &Parts,
        context: &mut RequestContext,
    ) -> Result<(), AuthRejection> {
        let Some((username, password)) = parse_basic_credentials(&parts.headers) else {
            return Err(self.reject().await);
        };

        let user = match self.users.find_by_username(&username).await {
            Ok(user) => user,
            Err(err) => {
                error!("Failed to lookup user for basic auth: {err:#}");
                return Err(self.reject().await);
            }
        };

        let stored_hash = user.as_ref().and_then(|user| user.password_hash.clone());
        let verified = spawn_verify(stored_hash, password).await;

        match user {
            Some(user) if verified => {
                context.identity = Some(AuthenticatedIdentity::from_user(&user, BASIC_SOURCE));
                Ok(())
            }
            _ => {
                debug!(%username, "basic auth rejected");
                Err(self.reject().await)
            }
        }
    }

    async fn reject(&self) -> AuthRejection {
        tokio::time::sleep(self.failure_delay).await;
        AuthRejection::Unauthorized {
            challenge: Some(HeaderValue::from_static(CHALLENGE)),
        }
    }
}

/// Decode `Authorization: Basic base64(user:pass)`.
#[must_use]
pub fn parse_basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    if username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}
