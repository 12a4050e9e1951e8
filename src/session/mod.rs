//! Session lifecycle: create, validate (with lazy expiry), close, list.
//!
//! Flow Overview:
//! 1) A successful login mints a random token and persists a `Session`.
//! 2) Each request presenting the cookie is validated; an expired session is closed
//!    on that first post-deadline access and reported as invalid.
//! 3) Logout closes the session. `closed_on` is written once and never cleared.
//!
//! Bearer API tokens are not sessions, but `validate_token_auth` synthesizes a
//! session-shaped view so downstream code sees one identity shape.

pub mod cookie;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    client_info::ClientInfo,
    store::{CloseOutcome, SessionRepository, User},
    token::{TokenError, TokenService},
    utils::generate_random_token,
};

pub use cookie::{SESSION_COOKIE_NAME, extract_bearer_token, extract_session_token};

/// Provider label recorded on sessions synthesized from API tokens.
pub const TOKEN_AUTH_PROVIDER: &str = "token_auth";
pub const DEFAULT_TOKEN_SESSION_WINDOW: Duration = Duration::hours(24);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(skip_serializing)]
    pub token: String,
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub provider: String,
    pub is_authenticated: bool,
    pub is_admin: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_until: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub closed_on: Option<OffsetDateTime>,
    pub client_info: ClientInfo,
}

impl Session {
    #[must_use]
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.is_authenticated && self.closed_on.is_none() && self.valid_until > now
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,
    #[error("Session already closed")]
    AlreadyClosed,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    token_session_window: Duration,
}

impl SessionStore {
    #[must_use]
    pub fn new(repo: Arc<dyn SessionRepository>) -> Self {
        Self {
            repo,
            token_session_window: DEFAULT_TOKEN_SESSION_WINDOW,
        }
    }

    #[must_use]
    pub fn with_token_session_window(mut self, window: Duration) -> Self {
        self.token_session_window = window;
        self
    }

    /// Persist a new session for `user`, valid for `validity` from now.
    ///
    /// # Errors
    /// Returns `SessionError::Internal` if the token cannot be generated or persisted.
    pub async fn new_session(
        &self,
        client_info: &ClientInfo,
        user: &User,
        provider: &str,
        validity: Duration,
    ) -> Result<Session, SessionError> {
        let now = OffsetDateTime::now_utc();
        let session = Session {
            token: generate_random_token::<32>()?,
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            provider: provider.to_string(),
            is_authenticated: true,
            is_admin: user.is_admin,
            created_at: now,
            valid_until: now + validity,
            last_activity: now,
            closed_on: None,
            client_info: client_info.clone(),
        };
        self.repo.insert(&session).await?;
        debug!(user_id = %user.id, provider, "session created");
        Ok(session)
    }

    /// Validate the session cookie carried by `headers`.
    ///
    /// Returns `Ok(None)` for a missing, unknown, closed or expired session. An expired
    /// session is closed as a side effect; that write is best effort.
    ///
    /// # Errors
    /// Returns `SessionError::Internal` if the lookup or the activity refresh fails.
    pub async fn validate_session(
        &self,
        headers: &HeaderMap,
        ip_address: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        let Some(token) = extract_session_token(headers) else {
            return Ok(None);
        };
        self.validate_token(&token, ip_address).await
    }

    /// Same as `validate_session` for an already extracted cookie value.
    ///
    /// # Errors
    /// Returns `SessionError::Internal` if the lookup or the activity refresh fails.
    pub async fn validate_token(
        &self,
        token: &str,
        ip_address: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        let Some(session) = self.repo.find_by_token(token).await? else {
            return Ok(None);
        };
        if session.closed_on.is_some() || !session.is_authenticated {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        if session.valid_until <= now {
            match self.repo.close(token, now).await {
                Ok(_) => debug!(user_id = %session.user_id, "session expired"),
                Err(err) => warn!("Failed to persist session expiry: {err:#}"),
            }
            return Ok(None);
        }

        // The conditional refresh loses against a concurrent close.
        Ok(self.repo.touch(token, now, ip_address).await?)
    }

    /// Resolve `Authorization: Bearer` into a session-shaped identity view.
    ///
    /// The view is never persisted. `Ok(None)` means no bearer credential was presented.
    ///
    /// # Errors
    /// Returns the `TokenError` classification when the bearer token is rejected.
    pub async fn validate_token_auth(
        &self,
        headers: &HeaderMap,
        tokens: &TokenService,
    ) -> Result<Option<Session>, TokenError> {
        let Some(bearer) = extract_bearer_token(headers) else {
            return Ok(None);
        };
        let (user, token) = tokens.validate_token(&bearer).await?;
        let now = OffsetDateTime::now_utc();

        Ok(Some(Session {
            token: token.id.to_string(),
            user_id: user.id,
            username: user.username,
            email: user.email,
            provider: TOKEN_AUTH_PROVIDER.to_string(),
            is_authenticated: true,
            is_admin: user.is_admin,
            created_at: token.created_at,
            valid_until: token
                .expires_at
                .unwrap_or(now + self.token_session_window),
            last_activity: now,
            closed_on: None,
            client_info: token.client_info.unwrap_or_default(),
        }))
    }

    /// Close a session. Closing is a one-time transition.
    ///
    /// # Errors
    /// Returns `SessionError::AlreadyClosed` on a second close and `SessionError::NotFound`
    /// for an unknown token.
    pub async fn end_session(&self, token: &str) -> Result<(), SessionError> {
        match self.repo.close(token, OffsetDateTime::now_utc()).await? {
            CloseOutcome::Closed => Ok(()),
            CloseOutcome::AlreadyClosed => Err(SessionError::AlreadyClosed),
            CloseOutcome::NotFound => Err(SessionError::NotFound),
        }
    }

    /// All sessions of a user in any state.
    ///
    /// # Errors
    /// Returns `SessionError::Internal` if the lookup fails.
    pub async fn find_sessions_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<Session>, SessionError> {
        Ok(self.repo.find_by_user_id(user_id).await?)
    }

    /// Read a session without validating or refreshing it.
    ///
    /// # Errors
    /// Returns `SessionError::Internal` if the lookup fails.
    pub async fn find_session(&self, token: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.repo.find_by_token(token).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemorySessionRepository, MemoryTokenRepository, MemoryUserRepository};
    use crate::store::{CreateUserOutcome, NewUser, UserRepository};
    use anyhow::{Result, anyhow};
    use axum::http::{
        HeaderValue,
        header::{AUTHORIZATION, COOKIE},
    };

    async fn user(repo: &MemoryUserRepository) -> Result<User> {
        match repo
            .create(NewUser {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: None,
                is_admin: false,
            })
            .await?
        {
            CreateUserOutcome::Created(user) => Ok(user),
            CreateUserOutcome::Conflict => Err(anyhow!("unexpected conflict")),
        }
    }

    fn cookie_headers(token: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE_NAME}={token}"))?,
        );
        Ok(headers)
    }

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemorySessionRepository::default()))
    }

    #[tokio::test]
    async fn new_session_is_live_and_validates() -> Result<()> {
        let users = MemoryUserRepository::default();
        let alice = user(&users).await?;
        let store = store();

        let session = store
            .new_session(&ClientInfo::default(), &alice, "basic", Duration::hours(1))
            .await?;
        assert!(session.is_live(OffsetDateTime::now_utc()));
        assert!(!session.token.is_empty());

        let validated = store
            .validate_session(&cookie_headers(&session.token)?, Some("198.51.100.4"))
            .await?
            .ok_or_else(|| anyhow!("session should validate"))?;
        assert_eq!(validated.user_id, alice.id);
        assert_eq!(validated.provider, "basic");
        assert_eq!(
            validated.client_info.ip_address.as_deref(),
            Some("198.51.100.4")
        );
        assert!(validated.last_activity >= session.last_activity);
        Ok(())
    }

    #[tokio::test]
    async fn expired_session_is_closed_on_first_access_and_stays_closed() -> Result<()> {
        let users = MemoryUserRepository::default();
        let alice = user(&users).await?;
        let store = store();

        let session = store
            .new_session(&ClientInfo::default(), &alice, "basic", Duration::hours(-1))
            .await?;
        let headers = cookie_headers(&session.token)?;

        assert!(store.validate_session(&headers, None).await?.is_none());
        let stored = store
            .find_session(&session.token)
            .await?
            .ok_or_else(|| anyhow!("session should still be stored"))?;
        assert!(stored.closed_on.is_some());

        assert!(store.validate_session(&headers, None).await?.is_none());
        let again = store
            .find_session(&session.token)
            .await?
            .ok_or_else(|| anyhow!("session should still be stored"))?;
        assert_eq!(again.closed_on, stored.closed_on);
        Ok(())
    }

    #[tokio::test]
    async fn end_session_is_one_time() -> Result<()> {
        let users = MemoryUserRepository::default();
        let alice = user(&users).await?;
        let store = store();
        let session = store
            .new_session(&ClientInfo::default(), &alice, "basic", Duration::hours(1))
            .await?;

        store.end_session(&session.token).await?;
        assert!(matches!(
            store.end_session(&session.token).await,
            Err(SessionError::AlreadyClosed)
        ));
        assert!(matches!(
            store.end_session("unknown").await,
            Err(SessionError::NotFound)
        ));
        assert!(
            store
                .validate_session(&cookie_headers(&session.token)?, None)
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_unknown_cookie_is_not_ok() -> Result<()> {
        let store = store();
        assert!(store.validate_session(&HeaderMap::new(), None).await?.is_none());
        assert!(
            store
                .validate_session(&cookie_headers("nope")?, None)
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn find_sessions_by_user_id_returns_all_states() -> Result<()> {
        let users = MemoryUserRepository::default();
        let alice = user(&users).await?;
        let store = store();
        let open = store
            .new_session(&ClientInfo::default(), &alice, "basic", Duration::hours(1))
            .await?;
        let closed = store
            .new_session(&ClientInfo::default(), &alice, "github", Duration::hours(1))
            .await?;
        store.end_session(&closed.token).await?;

        let sessions = store.find_sessions_by_user_id(alice.id).await?;
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().any(|s| s.token == open.token && s.closed_on.is_none()));
        assert!(sessions.iter().any(|s| s.token == closed.token && s.closed_on.is_some()));
        Ok(())
    }

    #[tokio::test]
    async fn token_auth_synthesizes_session_view() -> Result<()> {
        let users = Arc::new(MemoryUserRepository::default());
        let alice = user(&users).await?;
        let tokens = TokenService::new(Arc::new(MemoryTokenRepository::default()), users.clone());
        let (plaintext, token) = tokens
            .generate_token(alice.id, "CI", None, vec!["read".to_string()], "self", None)
            .await?;

        let store = store().with_token_session_window(Duration::hours(2));
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {plaintext}"))?,
        );
        let before = OffsetDateTime::now_utc();
        let session = store
            .validate_token_auth(&headers, &tokens)
            .await?
            .ok_or_else(|| anyhow!("bearer token should validate"))?;

        assert_eq!(session.user_id, alice.id);
        assert_eq!(session.provider, TOKEN_AUTH_PROVIDER);
        assert_eq!(session.token, token.id.to_string());
        assert!(session.valid_until >= before + Duration::hours(2));
        assert!(
            store
                .find_sessions_by_user_id(alice.id)
                .await?
                .is_empty(),
            "token sessions are never persisted"
        );
        Ok(())
    }

    #[tokio::test]
    async fn token_auth_without_bearer_is_none() -> Result<()> {
        let users = Arc::new(MemoryUserRepository::default());
        let tokens = TokenService::new(Arc::new(MemoryTokenRepository::default()), users);
        assert!(
            store()
                .validate_token_auth(&HeaderMap::new(), &tokens)
                .await?
                .is_none()
        );
        Ok(())
    }
}
