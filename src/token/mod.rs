//! API token issuance, validation and revocation.
//!
//! Tokens look like `tg_pat_<base64url(32 random bytes)>`. Only the SHA-256 digest is
//! persisted; the plaintext is returned once from [`TokenService::generate_token`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    client_info::ClientInfo,
    store::{DeactivateOutcome, Revocation, TokenRepository, User, UserRepository},
    utils::{generate_random_token, hash_token},
};

pub const TOKEN_PREFIX: &str = "tg_pat_";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Token {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip)]
    pub token_hash: Vec<u8>,
    pub name: String,
    pub scopes: Vec<String>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    pub usage_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    pub revoked_by: Option<Uuid>,
    pub created_from: String,
    pub client_info: Option<ClientInfo>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Token {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid token format")]
    InvalidFormat,
    #[error("Unknown token")]
    Unknown,
    #[error("Token is inactive")]
    Inactive,
    #[error("Token has expired")]
    Expired,
    #[error("Token not found")]
    NotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("Token does not belong to the requesting user")]
    NotOwner,
    #[error("Token name must not be empty")]
    InvalidName,
    #[error("Token already revoked")]
    AlreadyRevoked,
    #[error("Token already inactive")]
    AlreadyInactive,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct TokenService {
    tokens: Arc<dyn TokenRepository>,
    users: Arc<dyn UserRepository>,
}

impl TokenService {
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenRepository>, users: Arc<dyn UserRepository>) -> Self {
        Self { tokens, users }
    }

    /// Issue a token for `user_id`. Returns the plaintext exactly once.
    ///
    /// # Errors
    /// `UserNotFound` when the owner does not exist, `InvalidName` for a blank name.
    pub async fn generate_token(
        &self,
        user_id: Uuid,
        name: &str,
        expires_at: Option<OffsetDateTime>,
        scopes: Vec<String>,
        created_from: &str,
        client_info: Option<ClientInfo>,
    ) -> Result<(String, Token), TokenError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TokenError::InvalidName);
        }
        if self.users.find_by_id(user_id).await?.is_none() {
            return Err(TokenError::UserNotFound);
        }

        let plaintext = format!("{TOKEN_PREFIX}{}", generate_random_token::<32>()?);
        let mut scopes = scopes;
        scopes.sort();
        scopes.dedup();

        let token = Token {
            id: Uuid::now_v7(),
            user_id,
            token_hash: hash_token(&plaintext),
            name: name.to_string(),
            scopes,
            is_active: true,
            expires_at,
            usage_count: 0,
            last_used_at: None,
            revoked_at: None,
            revoked_by: None,
            created_from: created_from.to_string(),
            client_info,
            created_at: OffsetDateTime::now_utc(),
        };
        self.tokens.insert(&token).await?;
        debug!(token_id = %token.id, %user_id, "api token issued");

        Ok((plaintext, token))
    }

    /// Resolve a presented plaintext token to its owner.
    ///
    /// An expired token is deactivated on first access; later attempts keep reporting
    /// `Expired`. Usage accounting is best effort.
    ///
    /// # Errors
    /// `InvalidFormat` (no lookup performed), `Unknown`, `Inactive`, `Expired`.
    pub async fn validate_token(&self, plaintext: &str) -> Result<(User, Token), TokenError> {
        if !plaintext.starts_with(TOKEN_PREFIX) || plaintext.len() == TOKEN_PREFIX.len() {
            return Err(TokenError::InvalidFormat);
        }

        let Some(token) = self.tokens.find_by_hash(&hash_token(plaintext)).await? else {
            return Err(TokenError::Unknown);
        };

        let now = OffsetDateTime::now_utc();
        if !token.is_active {
            return Err(if token.revoked_at.is_none() && token.is_expired(now) {
                TokenError::Expired
            } else {
                TokenError::Inactive
            });
        }

        if token.is_expired(now) {
            match self.tokens.deactivate(token.id, None).await {
                Ok(_) => debug!(token_id = %token.id, "api token expired"),
                Err(err) => warn!("Failed to persist token expiry: {err:#}"),
            }
            return Err(TokenError::Expired);
        }

        let Some(user) = self.users.find_by_id(token.user_id).await? else {
            return Err(TokenError::Unknown);
        };

        let token = match self.tokens.record_usage(token.id, now).await {
            Ok(Some(updated)) => updated,
            // Lost the race against a concurrent revoke or expiry.
            Ok(None) => return Err(TokenError::Inactive),
            Err(err) => {
                warn!(token_id = %token.id, "Failed to record token usage: {err:#}");
                token
            }
        };

        Ok((user, token))
    }

    /// Owner revocation. `revoked_by` is recorded for the audit trail.
    ///
    /// # Errors
    /// `NotFound`, `NotOwner`, `AlreadyRevoked`, `AlreadyInactive`.
    pub async fn revoke_token(
        &self,
        token_id: Uuid,
        requesting_user_id: Uuid,
        revoked_by: Uuid,
    ) -> Result<Token, TokenError> {
        let Some(token) = self.tokens.find_by_id(token_id).await? else {
            return Err(TokenError::NotFound);
        };
        if token.user_id != requesting_user_id {
            return Err(TokenError::NotOwner);
        }
        self.deactivate(token_id, revoked_by).await
    }

    /// Administrator override: revoke a token of `owner_id` without being its owner.
    ///
    /// # Errors
    /// `NotFound` when the token does not exist or belongs to someone else.
    pub async fn revoke_token_as_admin(
        &self,
        token_id: Uuid,
        owner_id: Uuid,
        admin_id: Uuid,
    ) -> Result<Token, TokenError> {
        match self.tokens.find_by_id(token_id).await? {
            Some(token) if token.user_id == owner_id => {}
            _ => return Err(TokenError::NotFound),
        }
        self.deactivate(token_id, admin_id).await
    }

    async fn deactivate(&self, token_id: Uuid, revoked_by: Uuid) -> Result<Token, TokenError> {
        let revocation = Revocation {
            at: OffsetDateTime::now_utc(),
            by: revoked_by,
        };
        match self.tokens.deactivate(token_id, Some(revocation)).await? {
            DeactivateOutcome::Deactivated(token) => {
                debug!(%token_id, %revoked_by, "api token revoked");
                Ok(token)
            }
            DeactivateOutcome::AlreadyRevoked => Err(TokenError::AlreadyRevoked),
            DeactivateOutcome::AlreadyInactive => Err(TokenError::AlreadyInactive),
            DeactivateOutcome::NotFound => Err(TokenError::NotFound),
        }
    }

    /// # Errors
    /// `UserNotFound` when the user does not exist.
    pub async fn list_tokens(&self, user_id: Uuid) -> Result<Vec<Token>, TokenError> {
        if self.users.find_by_id(user_id).await?.is_none() {
            return Err(TokenError::UserNotFound);
        }
        Ok(self.tokens.list_by_user(user_id).await?)
    }

    /// Token metadata, visible only to its owner.
    ///
    /// # Errors
    /// `NotFound` for an unknown id or a token owned by another user.
    pub async fn get_token(&self, token_id: Uuid, user_id: Uuid) -> Result<Token, TokenError> {
        match self.tokens.find_by_id(token_id).await? {
            Some(token) if token.user_id == user_id => Ok(token),
            _ => Err(TokenError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryTokenRepository, MemoryUserRepository};
    use crate::store::{CreateUserOutcome, NewUser};
    use anyhow::{Result, anyhow};
    use time::Duration;

    struct Fixture {
        service: TokenService,
        tokens: Arc<MemoryTokenRepository>,
        alice: User,
        bob: User,
    }

    async fn create_user(users: &MemoryUserRepository, name: &str) -> Result<User> {
        match users
            .create(NewUser {
                username: name.to_string(),
                email: format!("{name}@example.com"),
                password_hash: None,
                is_admin: false,
            })
            .await?
        {
            CreateUserOutcome::Created(user) => Ok(user),
            CreateUserOutcome::Conflict => Err(anyhow!("unexpected conflict")),
        }
    }

    async fn fixture() -> Result<Fixture> {
        let users = Arc::new(MemoryUserRepository::default());
        let tokens = Arc::new(MemoryTokenRepository::default());
        let alice = create_user(&users, "alice").await?;
        let bob = create_user(&users, "bob").await?;
        Ok(Fixture {
            service: TokenService::new(tokens.clone(), users),
            tokens,
            alice,
            bob,
        })
    }

    #[tokio::test]
    async fn generate_stores_only_the_digest() -> Result<()> {
        let fx = fixture().await?;
        let (plaintext, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, vec!["read".to_string()], "self", None)
            .await?;

        assert!(plaintext.starts_with(TOKEN_PREFIX));
        assert_eq!(token.token_hash, hash_token(&plaintext));
        let stored = fx
            .tokens
            .find_by_id(token.id)
            .await?
            .ok_or_else(|| anyhow!("token should be stored"))?;
        assert_ne!(stored.token_hash, plaintext.as_bytes());
        assert!(stored.is_active);
        assert_eq!(stored.usage_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn generate_rejects_unknown_user_and_blank_name() -> Result<()> {
        let fx = fixture().await?;
        assert!(matches!(
            fx.service
                .generate_token(Uuid::now_v7(), "CI", None, Vec::new(), "self", None)
                .await,
            Err(TokenError::UserNotFound)
        ));
        assert!(matches!(
            fx.service
                .generate_token(fx.alice.id, "   ", None, Vec::new(), "self", None)
                .await,
            Err(TokenError::InvalidName)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn validate_increments_usage_by_one() -> Result<()> {
        let fx = fixture().await?;
        let (plaintext, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, vec!["read".to_string()], "self", None)
            .await?;

        let (user, validated) = fx.service.validate_token(&plaintext).await?;
        assert_eq!(user.id, fx.alice.id);
        assert_eq!(validated.usage_count, token.usage_count + 1);
        assert!(validated.last_used_at.is_some());

        let (_, again) = fx.service.validate_token(&plaintext).await?;
        assert_eq!(again.usage_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn validate_rejects_malformed_and_unknown() -> Result<()> {
        let fx = fixture().await?;
        assert!(matches!(
            fx.service.validate_token("ghp_abcdef").await,
            Err(TokenError::InvalidFormat)
        ));
        assert!(matches!(
            fx.service.validate_token(TOKEN_PREFIX).await,
            Err(TokenError::InvalidFormat)
        ));
        assert!(matches!(
            fx.service.validate_token("tg_pat_doesnotexist").await,
            Err(TokenError::Unknown)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn expired_token_is_rejected_idempotently() -> Result<()> {
        let fx = fixture().await?;
        let past = OffsetDateTime::now_utc() - Duration::hours(1);
        let (plaintext, token) = fx
            .service
            .generate_token(fx.alice.id, "old", Some(past), Vec::new(), "self", None)
            .await?;

        assert!(matches!(
            fx.service.validate_token(&plaintext).await,
            Err(TokenError::Expired)
        ));
        let stored = fx
            .tokens
            .find_by_id(token.id)
            .await?
            .ok_or_else(|| anyhow!("token should be stored"))?;
        assert!(!stored.is_active);
        assert!(stored.revoked_at.is_none());

        assert!(matches!(
            fx.service.validate_token(&plaintext).await,
            Err(TokenError::Expired)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_twice_reports_already_revoked() -> Result<()> {
        let fx = fixture().await?;
        let (plaintext, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, vec!["read".to_string()], "self", None)
            .await?;

        let (_, validated) = fx.service.validate_token(&plaintext).await?;
        assert_eq!(validated.usage_count, 1);

        let revoked = fx
            .service
            .revoke_token(token.id, fx.alice.id, fx.alice.id)
            .await?;
        assert!(!revoked.is_active);
        assert_eq!(revoked.revoked_by, Some(fx.alice.id));
        assert!(revoked.revoked_at.is_some());

        assert!(matches!(
            fx.service
                .revoke_token(token.id, fx.alice.id, fx.alice.id)
                .await,
            Err(TokenError::AlreadyRevoked)
        ));
        assert!(matches!(
            fx.service.validate_token(&plaintext).await,
            Err(TokenError::Inactive)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_checks_ownership() -> Result<()> {
        let fx = fixture().await?;
        let (_, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, Vec::new(), "self", None)
            .await?;

        assert!(matches!(
            fx.service.revoke_token(token.id, fx.bob.id, fx.bob.id).await,
            Err(TokenError::NotOwner)
        ));
        assert!(matches!(
            fx.service
                .revoke_token(Uuid::now_v7(), fx.alice.id, fx.alice.id)
                .await,
            Err(TokenError::NotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn revoke_expired_token_reports_already_inactive() -> Result<()> {
        let fx = fixture().await?;
        let past = OffsetDateTime::now_utc() - Duration::minutes(5);
        let (plaintext, token) = fx
            .service
            .generate_token(fx.alice.id, "old", Some(past), Vec::new(), "self", None)
            .await?;
        let _ = fx.service.validate_token(&plaintext).await;

        assert!(matches!(
            fx.service
                .revoke_token(token.id, fx.alice.id, fx.alice.id)
                .await,
            Err(TokenError::AlreadyInactive)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn admin_override_revokes_foreign_token() -> Result<()> {
        let fx = fixture().await?;
        let (_, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, Vec::new(), "admin", None)
            .await?;

        assert!(matches!(
            fx.service
                .revoke_token_as_admin(token.id, fx.bob.id, fx.bob.id)
                .await,
            Err(TokenError::NotFound)
        ));
        let revoked = fx
            .service
            .revoke_token_as_admin(token.id, fx.alice.id, fx.bob.id)
            .await?;
        assert_eq!(revoked.revoked_by, Some(fx.bob.id));
        Ok(())
    }

    #[tokio::test]
    async fn list_and_get_are_owner_scoped() -> Result<()> {
        let fx = fixture().await?;
        let (_, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, Vec::new(), "self", None)
            .await?;
        fx.service
            .generate_token(fx.bob.id, "deploy", None, Vec::new(), "self", None)
            .await?;

        let listed = fx.service.list_tokens(fx.alice.id).await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, token.id);

        assert_eq!(fx.service.get_token(token.id, fx.alice.id).await?.name, "CI");
        assert!(matches!(
            fx.service.get_token(token.id, fx.bob.id).await,
            Err(TokenError::NotFound)
        ));
        assert!(matches!(
            fx.service.list_tokens(Uuid::now_v7()).await,
            Err(TokenError::UserNotFound)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_validations_after_revoke_are_rejected() -> Result<()> {
        let fx = fixture().await?;
        let (plaintext, token) = fx
            .service
            .generate_token(fx.alice.id, "CI", None, Vec::new(), "self", None)
            .await?;
        fx.service
            .revoke_token(token.id, fx.alice.id, fx.alice.id)
            .await?;

        let (first, second) = tokio::join!(
            fx.service.validate_token(&plaintext),
            fx.service.validate_token(&plaintext)
        );
        assert!(matches!(first, Err(TokenError::Inactive)));
        assert!(matches!(second, Err(TokenError::Inactive)));
        Ok(())
    }
}
