//! In-memory repositories.
//!
//! Each store keeps its records behind one `tokio::sync::Mutex`; every operation runs
//! start to finish under that lock, so conditional transitions are serialized per store.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CloseOutcome, CreateUserOutcome, DeactivateOutcome, ExternalIdentity, LinkOutcome, NewUser,
    Revocation, SessionRepository, TokenRepository, User, UserRepository, may_link_by_email,
    username_candidates,
};
use crate::{session::Session, token::Token};

#[derive(Default)]
struct UserTable {
    users: HashMap<Uuid, User>,
    links: HashMap<(String, String), Uuid>,
}

impl UserTable {
    fn username_taken(&self, username: &str) -> bool {
        self.users
            .values()
            .any(|user| user.username.eq_ignore_ascii_case(username))
    }

    fn find_by_email(&self, email: &str) -> Option<&User> {
        self.users
            .values()
            .find(|user| !user.email.is_empty() && user.email.eq_ignore_ascii_case(email))
    }

    fn insert(&mut self, user: NewUser) -> User {
        let user = User {
            id: Uuid::now_v7(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            is_admin: user.is_admin,
            created_at: OffsetDateTime::now_utc(),
        };
        self.users.insert(user.id, user.clone());
        user
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    inner: Mutex<UserTable>,
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .lock()
            .await
            .users
            .values()
            .find(|user| user.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn create(&self, user: NewUser) -> Result<CreateUserOutcome> {
        let mut table = self.inner.lock().await;
        if table.username_taken(&user.username)
            || (!user.email.is_empty() && table.find_by_email(&user.email).is_some())
        {
            return Ok(CreateUserOutcome::Conflict);
        }
        Ok(CreateUserOutcome::Created(table.insert(user)))
    }

    async fn find_or_create_external(&self, identity: &ExternalIdentity) -> Result<LinkOutcome> {
        let mut table = self.inner.lock().await;
        let key = (identity.provider.clone(), identity.subject.clone());

        if let Some(user) = table
            .links
            .get(&key)
            .and_then(|user_id| table.users.get(user_id))
        {
            return Ok(LinkOutcome::Linked(user.clone()));
        }

        if let Some(existing) = identity
            .email
            .as_deref()
            .and_then(|email| table.find_by_email(email))
            .cloned()
        {
            let linked_elsewhere = table
                .links
                .iter()
                .any(|((provider, _), user_id)| provider == &identity.provider && *user_id == existing.id);
            if linked_elsewhere || !may_link_by_email(identity, &existing) {
                return Ok(LinkOutcome::Conflict);
            }
            table.links.insert(key, existing.id);
            return Ok(LinkOutcome::Linked(existing));
        }

        let Some(username) = username_candidates(identity).find(|name| !table.username_taken(name))
        else {
            return Ok(LinkOutcome::Conflict);
        };
        let user = table.insert(NewUser {
            username,
            email: identity.email.clone().unwrap_or_default(),
            password_hash: None,
            is_admin: false,
        });
        table.links.insert(key, user.id);
        Ok(LinkOutcome::Linked(user))
    }
}

#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: Mutex<HashMap<String, Session>>,
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn insert(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.token) {
            anyhow::bail!("session token collision");
        }
        sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Session>> {
        Ok(self.sessions.lock().await.get(token).cloned())
    }

    async fn close(&self, token: &str, at: OffsetDateTime) -> Result<CloseOutcome> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(token) else {
            return Ok(CloseOutcome::NotFound);
        };
        if session.closed_on.is_some() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        session.closed_on = Some(at);
        Ok(CloseOutcome::Closed)
    }

    async fn touch(
        &self,
        token: &str,
        at: OffsetDateTime,
        ip_address: Option<&str>,
    ) -> Result<Option<Session>> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(token).filter(|session| session.is_live(at)) else {
            return Ok(None);
        };
        session.last_activity = at;
        if let Some(ip) = ip_address {
            session.client_info.ip_address = Some(ip.to_string());
        }
        Ok(Some(session.clone()))
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

#[derive(Default)]
pub struct MemoryTokenRepository {
    tokens: Mutex<HashMap<Uuid, Token>>,
}

#[async_trait]
impl TokenRepository for MemoryTokenRepository {
    async fn insert(&self, token: &Token) -> Result<()> {
        self.tokens.lock().await.insert(token.id, token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<Token>> {
        Ok(self
            .tokens
            .lock()
            .await
            .values()
            .find(|token| token.token_hash == token_hash)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Token>> {
        Ok(self.tokens.lock().await.get(&id).cloned())
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Token>> {
        let mut tokens: Vec<Token> = self
            .tokens
            .lock()
            .await
            .values()
            .filter(|token| token.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tokens)
    }

    async fn record_usage(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Token>> {
        let mut tokens = self.tokens.lock().await;
        let Some(token) = tokens.get_mut(&id).filter(|token| {
            token.is_active && token.expires_at.is_none_or(|expires_at| expires_at > at)
        }) else {
            return Ok(None);
        };
        token.usage_count += 1;
        token.last_used_at = Some(at);
        Ok(Some(token.clone()))
    }

    async fn deactivate(
        &self,
        id: Uuid,
        revocation: Option<Revocation>,
    ) -> Result<DeactivateOutcome> {
        let mut tokens = self.tokens.lock().await;
        let Some(token) = tokens.get_mut(&id) else {
            return Ok(DeactivateOutcome::NotFound);
        };
        if !token.is_active {
            return Ok(if token.revoked_at.is_some() {
                DeactivateOutcome::AlreadyRevoked
            } else {
                DeactivateOutcome::AlreadyInactive
            });
        }
        token.is_active = false;
        if let Some(revocation) = revocation {
            token.revoked_at = Some(revocation.at);
            token.revoked_by = Some(revocation.by);
        }
        Ok(DeactivateOutcome::Deactivated(token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_info::ClientInfo;
    use anyhow::anyhow;
    use time::Duration;

    fn identity(subject: &str, email: Option<&str>, username: Option<&str>) -> ExternalIdentity {
        ExternalIdentity {
            provider: "github".to_string(),
            subject: subject.to_string(),
            email: email.map(str::to_string),
            email_verified: true,
            username: username.map(str::to_string),
        }
    }

    fn linked(outcome: LinkOutcome) -> Result<User> {
        match outcome {
            LinkOutcome::Linked(user) => Ok(user),
            LinkOutcome::Conflict => Err(anyhow!("unexpected link conflict")),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_username_or_email() -> Result<()> {
        let repo = MemoryUserRepository::default();
        let new_user = |username: &str, email: &str| NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: None,
            is_admin: false,
        };
        assert!(matches!(
            repo.create(new_user("alice", "alice@example.com")).await?,
            CreateUserOutcome::Created(_)
        ));
        assert!(matches!(
            repo.create(new_user("Alice", "other@example.com")).await?,
            CreateUserOutcome::Conflict
        ));
        assert!(matches!(
            repo.create(new_user("alice2", "ALICE@example.com")).await?,
            CreateUserOutcome::Conflict
        ));
        Ok(())
    }

    #[tokio::test]
    async fn external_identity_is_stable_per_subject() -> Result<()> {
        let repo = MemoryUserRepository::default();
        let first = linked(
            repo.find_or_create_external(&identity("42", Some("cat@example.com"), Some("octocat")))
                .await?,
        )?;
        let second = linked(
            repo.find_or_create_external(&identity("42", None, Some("renamed")))
                .await?,
        )?;
        assert_eq!(first.id, second.id);
        assert_eq!(first.username, "octocat");
        Ok(())
    }

    #[tokio::test]
    async fn external_identity_links_existing_email_once_per_provider() -> Result<()> {
        let repo = MemoryUserRepository::default();
        let CreateUserOutcome::Created(local) = repo
            .create(NewUser {
                username: "cat".to_string(),
                email: "cat@example.com".to_string(),
                password_hash: None,
                is_admin: false,
            })
            .await?
        else {
            return Err(anyhow!("unexpected conflict"));
        };

        let user = linked(
            repo.find_or_create_external(&identity("42", Some("cat@example.com"), None))
                .await?,
        )?;
        assert_eq!(user.id, local.id);

        assert!(matches!(
            repo.find_or_create_external(&identity("99", Some("cat@example.com"), None))
                .await?,
            LinkOutcome::Conflict
        ));
        Ok(())
    }

    #[tokio::test]
    async fn external_identity_disambiguates_taken_username() -> Result<()> {
        let repo = MemoryUserRepository::default();
        linked(
            repo.find_or_create_external(&identity("1111111111", None, Some("octocat")))
                .await?,
        )?;
        let second = linked(
            repo.find_or_create_external(&identity("2222222222", None, Some("octocat")))
                .await?,
        )?;
        assert_eq!(second.username, "octocat-github-22222222");
        Ok(())
    }

    #[tokio::test]
    async fn external_identity_skips_username_held_by_disambiguated_name() -> Result<()> {
        let repo = MemoryUserRepository::default();
        repo.create(NewUser {
            username: "octocat-github-22222222".to_string(),
            email: String::new(),
            password_hash: None,
            is_admin: false,
        })
        .await?;
        linked(
            repo.find_or_create_external(&identity("1111111111", None, Some("octocat")))
                .await?,
        )?;

        let second = linked(
            repo.find_or_create_external(&identity("2222222222", None, Some("octocat")))
                .await?,
        )?;
        assert_eq!(second.username, "octocat-github-22222222-2");
        let third = linked(
            repo.find_or_create_external(&identity("2222222299", None, Some("octocat")))
                .await?,
        )?;
        assert_eq!(third.username, "octocat-github-22222222-3");
        Ok(())
    }

    #[tokio::test]
    async fn external_identity_never_claims_password_or_admin_accounts() -> Result<()> {
        let repo = MemoryUserRepository::default();
        for (username, email, password_hash, is_admin) in [
            ("root", "root@example.com", None, true),
            ("alice", "alice@example.com", Some("$argon2id$stored".to_string()), false),
        ] {
            repo.create(NewUser {
                username: username.to_string(),
                email: email.to_string(),
                password_hash,
                is_admin,
            })
            .await?;
        }

        for email in ["root@example.com", "ALICE@example.com"] {
            assert!(matches!(
                repo.find_or_create_external(&identity("42", Some(email), Some("mallory")))
                    .await?,
                LinkOutcome::Conflict
            ));
        }
        assert!(repo.find_by_username("mallory").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unverified_email_is_never_linked() -> Result<()> {
        let repo = MemoryUserRepository::default();
        repo.create(NewUser {
            username: "cat".to_string(),
            email: "cat@example.com".to_string(),
            password_hash: None,
            is_admin: false,
        })
        .await?;

        let unverified = ExternalIdentity {
            email_verified: false,
            ..identity("42", Some("cat@example.com"), Some("mallory"))
        };
        assert!(matches!(
            repo.find_or_create_external(&unverified).await?,
            LinkOutcome::Conflict
        ));

        let fresh = ExternalIdentity {
            email_verified: false,
            ..identity("43", Some("kitten@example.com"), Some("kitten"))
        };
        let user = linked(repo.find_or_create_external(&fresh).await?)?;
        assert_eq!(user.username, "kitten");
        Ok(())
    }

    fn session(token: &str, valid_for: Duration) -> Session {
        let now = OffsetDateTime::now_utc();
        Session {
            token: token.to_string(),
            user_id: Uuid::now_v7(),
            username: "alice".to_string(),
            email: "alice@example.com".to_string(),
            provider: "basic".to_string(),
            is_authenticated: true,
            is_admin: false,
            created_at: now,
            valid_until: now + valid_for,
            last_activity: now,
            closed_on: None,
            client_info: ClientInfo::default(),
        }
    }

    #[tokio::test]
    async fn touch_never_applies_after_close() -> Result<()> {
        let repo = MemorySessionRepository::default();
        repo.insert(&session("tok", Duration::hours(1))).await?;

        let now = OffsetDateTime::now_utc();
        assert!(repo.touch("tok", now, Some("192.0.2.1")).await?.is_some());
        assert_eq!(repo.close("tok", now).await?, CloseOutcome::Closed);
        assert_eq!(repo.close("tok", now).await?, CloseOutcome::AlreadyClosed);
        assert!(repo.touch("tok", now, None).await?.is_none());
        assert_eq!(repo.close("missing", now).await?, CloseOutcome::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn touch_rejects_expired_session() -> Result<()> {
        let repo = MemorySessionRepository::default();
        repo.insert(&session("tok", Duration::seconds(-1))).await?;
        assert!(
            repo.touch("tok", OffsetDateTime::now_utc(), None)
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_session_token_is_an_error() -> Result<()> {
        let repo = MemorySessionRepository::default();
        repo.insert(&session("tok", Duration::hours(1))).await?;
        assert!(repo.insert(&session("tok", Duration::hours(1))).await.is_err());
        Ok(())
    }
}
