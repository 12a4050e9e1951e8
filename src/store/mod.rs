//! Persistence boundary for users, sessions and API tokens.
//!
//! Every lifecycle transition (session close, token deactivation, usage increment) is
//! a conditional update performed by the repository in one step, so two concurrent
//! validations can never both observe "active" after one of them moved the record
//! to a terminal state.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{session::Session, token::Token};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub is_admin: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub is_admin: bool,
}

/// Identity asserted by a delegated provider after a verified identity-endpoint call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub provider: String,
    pub subject: String,
    pub email: Option<String>,
    /// The provider asserted ownership of `email`.
    pub email_verified: bool,
    pub username: Option<String>,
}

#[derive(Debug)]
pub enum CreateUserOutcome {
    Created(User),
    Conflict,
}

#[derive(Debug)]
pub enum LinkOutcome {
    Linked(User),
    /// The email belongs to a user this identity may not claim: the email is unverified,
    /// the user has a password or admin rights, or is linked to another identity of this
    /// provider.
    Conflict,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Revocation {
    pub at: OffsetDateTime,
    pub by: Uuid,
}

#[derive(Debug)]
pub enum DeactivateOutcome {
    Deactivated(Token),
    AlreadyRevoked,
    AlreadyInactive,
    NotFound,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_by_username(&self, username: &str) -> Result<Option<User>>;
    async fn create(&self, user: NewUser) -> Result<CreateUserOutcome>;
    async fn find_or_create_external(&self, identity: &ExternalIdentity) -> Result<LinkOutcome>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;
    async fn find_by_token(&self, token: &str) -> Result<Option<Session>>;
    /// Set `closed_on` only if it is still null.
    async fn close(&self, token: &str, at: OffsetDateTime) -> Result<CloseOutcome>;
    /// Refresh activity only while the session is live at `at`; `None` otherwise.
    async fn touch(
        &self,
        token: &str,
        at: OffsetDateTime,
        ip_address: Option<&str>,
    ) -> Result<Option<Session>>;
    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>>;
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn insert(&self, token: &Token) -> Result<()>;
    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<Token>>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Token>>;
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Token>>;
    /// Increment usage only while the token is active and unexpired at `at`.
    async fn record_usage(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Token>>;
    /// Flip `is_active` to false only if it is still true.
    async fn deactivate(&self, id: Uuid, revocation: Option<Revocation>)
    -> Result<DeactivateOutcome>;
}

/// Username for a freshly linked external identity.
pub(crate) fn external_username(identity: &ExternalIdentity) -> String {
    identity
        .username
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| {
            identity
                .email
                .as_deref()
                .and_then(|email| email.split('@').next())
                .filter(|local| !local.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("{}-{}", identity.provider, identity.subject))
}

pub(crate) fn disambiguate_username(base: &str, identity: &ExternalIdentity) -> String {
    let suffix: String = identity.subject.chars().take(8).collect();
    format!("{base}-{}-{suffix}", identity.provider)
}

/// Usernames to try for a new external user, most preferred first. Never ends.
pub(crate) fn username_candidates(identity: &ExternalIdentity) -> impl Iterator<Item = String> {
    let base = external_username(identity);
    let disambiguated = disambiguate_username(&base, identity);
    let numbered = disambiguated.clone();
    std::iter::once(base)
        .chain(std::iter::once(disambiguated))
        .chain((2u32..).map(move |n| format!("{numbered}-{n}")))
}

/// Whether an external identity may be attached to an existing user found by email.
///
/// Local credentials and admin rights are never handed to a provider login.
pub(crate) fn may_link_by_email(identity: &ExternalIdentity, existing: &User) -> bool {
    identity.email_verified && existing.password_hash.is_none() && !existing.is_admin
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(username: Option<&str>, email: Option<&str>) -> ExternalIdentity {
        ExternalIdentity {
            provider: "github".to_string(),
            subject: "123456789".to_string(),
            email: email.map(str::to_string),
            email_verified: true,
            username: username.map(str::to_string),
        }
    }

    fn user(password_hash: Option<&str>, is_admin: bool) -> User {
        User {
            id: Uuid::now_v7(),
            username: "cat".to_string(),
            email: "cat@example.com".to_string(),
            password_hash: password_hash.map(str::to_string),
            is_admin,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn external_username_prefers_provider_login() {
        let id = identity(Some("octocat"), Some("cat@example.com"));
        assert_eq!(external_username(&id), "octocat");
    }

    #[test]
    fn external_username_falls_back_to_email_then_subject() {
        assert_eq!(
            external_username(&identity(None, Some("cat@example.com"))),
            "cat"
        );
        assert_eq!(external_username(&identity(Some("  "), None)), "github-123456789");
    }

    #[test]
    fn disambiguated_username_embeds_provider_and_subject() {
        let id = identity(Some("octocat"), None);
        assert_eq!(disambiguate_username("octocat", &id), "octocat-github-12345678");
    }

    #[test]
    fn username_candidates_keep_counting_after_disambiguation() {
        let id = identity(Some("octocat"), None);
        let candidates: Vec<String> = username_candidates(&id).take(4).collect();
        assert_eq!(
            candidates,
            [
                "octocat",
                "octocat-github-12345678",
                "octocat-github-12345678-2",
                "octocat-github-12345678-3",
            ]
        );
    }

    #[test]
    fn email_link_needs_verified_email_and_unprivileged_user() {
        let verified = identity(None, Some("cat@example.com"));
        let unverified = ExternalIdentity {
            email_verified: false,
            ..verified.clone()
        };

        assert!(may_link_by_email(&verified, &user(None, false)));
        assert!(!may_link_by_email(&unverified, &user(None, false)));
        assert!(!may_link_by_email(&verified, &user(Some("$argon2id$x"), false)));
        assert!(!may_link_by_email(&verified, &user(None, true)));
    }
}
