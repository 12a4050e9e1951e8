//! PostgreSQL repositories (schema in `sql/schema.sql`, applied at startup).
//!
//! Lifecycle transitions are single `UPDATE ... WHERE <still in source state> RETURNING`
//! statements; an empty result means another writer got there first.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow, types::Json};
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    CloseOutcome, CreateUserOutcome, DeactivateOutcome, ExternalIdentity, LinkOutcome, NewUser,
    Revocation, SessionRepository, TokenRepository, User, UserRepository, may_link_by_email,
    username_candidates,
};
use crate::{client_info::ClientInfo, session::Session, token::Token, utils::is_unique_violation};

macro_rules! db_span {
    ($operation:literal, $query:expr) => {
        tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = $operation,
            db.statement = $query
        )
    };
}

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

/// Apply the embedded schema. Every statement is idempotent, so this runs on each start.
///
/// # Errors
/// Returns an error naming the first statement that fails.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    let mut connection = pool
        .acquire()
        .await
        .context("failed to acquire connection for schema setup")?;
    for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut *connection)
            .instrument(db_span!("DDL", statement.as_str()))
            .await
            .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
    }
    Ok(())
}

/// Split on statement-terminating `;`. Statements must not nest semicolons.
fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }
    statements
}

const USER_COLUMNS: &str = "id, username, email, password_hash, is_admin, created_at";
const SESSION_COLUMNS: &str = "token, user_id, username, email, provider, is_authenticated, \
     is_admin, created_at, valid_until, last_activity, closed_on, client_info";
const TOKEN_COLUMNS: &str = "id, user_id, token_hash, name, scopes, is_active, expires_at, \
     usage_count, last_used_at, revoked_at, revoked_by, created_from, client_info, created_at";

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        is_admin: row.try_get("is_admin")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    let Json(client_info): Json<ClientInfo> = row.try_get("client_info")?;
    Ok(Session {
        token: row.try_get("token")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        provider: row.try_get("provider")?,
        is_authenticated: row.try_get("is_authenticated")?,
        is_admin: row.try_get("is_admin")?,
        created_at: row.try_get("created_at")?,
        valid_until: row.try_get("valid_until")?,
        last_activity: row.try_get("last_activity")?,
        closed_on: row.try_get("closed_on")?,
        client_info,
    })
}

fn token_from_row(row: &PgRow) -> Result<Token> {
    let client_info: Option<Json<ClientInfo>> = row.try_get("client_info")?;
    Ok(Token {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        token_hash: row.try_get("token_hash")?,
        name: row.try_get("name")?,
        scopes: row.try_get("scopes")?,
        is_active: row.try_get("is_active")?,
        expires_at: row.try_get("expires_at")?,
        usage_count: row.try_get("usage_count")?,
        last_used_at: row.try_get("last_used_at")?,
        revoked_at: row.try_get("revoked_at")?,
        revoked_by: row.try_get("revoked_by")?,
        created_from: row.try_get("created_from")?,
        client_info: client_info.map(|Json(info)| info),
        created_at: row.try_get("created_at")?,
    })
}

pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn find_user_where(
    executor: impl sqlx::PgExecutor<'_>,
    predicate: &str,
    value: &str,
) -> Result<Option<User>> {
    let query = format!("SELECT {USER_COLUMNS} FROM users WHERE {predicate}");
    let row = sqlx::query(&query)
        .bind(value)
        .fetch_optional(executor)
        .instrument(db_span!("SELECT", query.as_str()))
        .await
        .context("failed to lookup user")?;
    row.as_ref().map(user_from_row).transpose()
}

async fn find_linked_user(
    executor: impl sqlx::PgExecutor<'_>,
    identity: &ExternalIdentity,
) -> Result<Option<User>> {
    let query = r"
        SELECT u.id, u.username, u.email, u.password_hash, u.is_admin, u.created_at
        FROM user_identities i
        JOIN users u ON u.id = i.user_id
        WHERE i.provider = $1 AND i.subject = $2
    ";
    let row = sqlx::query(query)
        .bind(&identity.provider)
        .bind(&identity.subject)
        .fetch_optional(executor)
        .instrument(db_span!("SELECT", query))
        .await
        .context("failed to lookup linked identity")?;
    row.as_ref().map(user_from_row).transpose()
}

async fn insert_identity_link(
    executor: impl sqlx::PgExecutor<'_>,
    identity: &ExternalIdentity,
    user_id: Uuid,
) -> Result<bool> {
    let query = r"
        INSERT INTO user_identities (provider, subject, user_id)
        VALUES ($1, $2, $3)
        ON CONFLICT DO NOTHING
    ";
    let result = sqlx::query(query)
        .bind(&identity.provider)
        .bind(&identity.subject)
        .bind(user_id)
        .execute(executor)
        .instrument(db_span!("INSERT", query))
        .await
        .context("failed to link identity")?;
    Ok(result.rows_affected() == 1)
}

const MAX_USERNAME_CANDIDATES: usize = 32;

async fn insert_user(executor: impl sqlx::PgExecutor<'_>, user: &NewUser) -> Result<Option<User>> {
    let query = format!(
        "INSERT INTO users (id, username, email, password_hash, is_admin) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {USER_COLUMNS}"
    );
    let row = sqlx::query(&query)
        .bind(Uuid::now_v7())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .fetch_one(executor)
        .instrument(db_span!("INSERT", query.as_str()))
        .await;
    match row {
        Ok(row) => Ok(Some(user_from_row(&row)?)),
        Err(err) if is_unique_violation(&err) => Ok(None),
        Err(err) => Err(err).context("failed to insert user"),
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to lookup user by id")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        find_user_where(&self.pool, "LOWER(username) = LOWER($1)", username).await
    }

    async fn create(&self, user: NewUser) -> Result<CreateUserOutcome> {
        Ok(match insert_user(&self.pool, &user).await? {
            Some(user) => CreateUserOutcome::Created(user),
            None => CreateUserOutcome::Conflict,
        })
    }

    async fn find_or_create_external(&self, identity: &ExternalIdentity) -> Result<LinkOutcome> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin identity link transaction")?;

        if let Some(user) = find_linked_user(&mut *tx, identity).await? {
            tx.commit().await.context("commit identity link")?;
            return Ok(LinkOutcome::Linked(user));
        }

        let existing = match identity.email.as_deref().filter(|email| !email.is_empty()) {
            Some(email) => find_user_where(&mut *tx, "LOWER(email) = LOWER($1)", email).await?,
            None => None,
        };

        let user = if let Some(existing) = existing {
            if !may_link_by_email(identity, &existing) {
                tx.rollback().await.context("rollback identity link")?;
                return Ok(LinkOutcome::Conflict);
            }
            existing
        } else {
            let mut username = None;
            for candidate in username_candidates(identity).take(MAX_USERNAME_CANDIDATES) {
                if find_user_where(&mut *tx, "LOWER(username) = LOWER($1)", &candidate)
                    .await?
                    .is_none()
                {
                    username = Some(candidate);
                    break;
                }
            }
            let Some(username) = username else {
                tx.rollback().await.context("rollback identity link")?;
                return Ok(LinkOutcome::Conflict);
            };
            let new_user = NewUser {
                username,
                email: identity.email.clone().unwrap_or_default(),
                password_hash: None,
                is_admin: false,
            };
            insert_user(&mut *tx, &new_user)
                .await?
                .context("generated username already taken")?
        };

        if !insert_identity_link(&mut *tx, identity, user.id).await? {
            // Either a concurrent callback linked this subject, or the user already
            // carries another identity of this provider.
            let linked = find_linked_user(&mut *tx, identity).await?;
            tx.rollback().await.context("rollback identity link")?;
            return Ok(linked.map_or(LinkOutcome::Conflict, LinkOutcome::Linked));
        }

        tx.commit().await.context("commit identity link")?;
        Ok(LinkOutcome::Linked(user))
    }
}

pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert(&self, session: &Session) -> Result<()> {
        let query = r"
            INSERT INTO sessions
                (token, user_id, username, email, provider, is_authenticated, is_admin,
                 created_at, valid_until, last_activity, closed_on, client_info)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        ";
        sqlx::query(query)
            .bind(&session.token)
            .bind(session.user_id)
            .bind(&session.username)
            .bind(&session.email)
            .bind(&session.provider)
            .bind(session.is_authenticated)
            .bind(session.is_admin)
            .bind(session.created_at)
            .bind(session.valid_until)
            .bind(session.last_activity)
            .bind(session.closed_on)
            .bind(Json(&session.client_info))
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token = $1");
        let row = sqlx::query(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to lookup session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn close(&self, token: &str, at: OffsetDateTime) -> Result<CloseOutcome> {
        let query = r"
            UPDATE sessions
            SET closed_on = $2
            WHERE token = $1 AND closed_on IS NULL
        ";
        let result = sqlx::query(query)
            .bind(token)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to close session")?;
        if result.rows_affected() == 1 {
            return Ok(CloseOutcome::Closed);
        }

        let query = "SELECT 1 FROM sessions WHERE token = $1";
        let exists = sqlx::query(query)
            .bind(token)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .context("failed to lookup session")?
            .is_some();
        Ok(if exists {
            CloseOutcome::AlreadyClosed
        } else {
            CloseOutcome::NotFound
        })
    }

    async fn touch(
        &self,
        token: &str,
        at: OffsetDateTime,
        ip_address: Option<&str>,
    ) -> Result<Option<Session>> {
        let query = format!(
            "UPDATE sessions \
             SET last_activity = $2, \
                 client_info = CASE WHEN $3::text IS NULL THEN client_info \
                     ELSE jsonb_set(client_info, '{{ip_address}}', to_jsonb($3::text)) END \
             WHERE token = $1 AND closed_on IS NULL AND is_authenticated AND valid_until > $2 \
             RETURNING {SESSION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(token)
            .bind(at)
            .bind(ip_address)
            .fetch_optional(&self.pool)
            .instrument(db_span!("UPDATE", query.as_str()))
            .await
            .context("failed to refresh session activity")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to list sessions")?;
        rows.iter().map(session_from_row).collect()
    }
}

pub struct PgTokenRepository {
    pool: PgPool,
}

impl PgTokenRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TokenRepository for PgTokenRepository {
    async fn insert(&self, token: &Token) -> Result<()> {
        let query = r"
            INSERT INTO api_tokens
                (id, user_id, token_hash, name, scopes, is_active, expires_at, usage_count,
                 last_used_at, revoked_at, revoked_by, created_from, client_info, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ";
        sqlx::query(query)
            .bind(token.id)
            .bind(token.user_id)
            .bind(&token.token_hash)
            .bind(&token.name)
            .bind(&token.scopes)
            .bind(token.is_active)
            .bind(token.expires_at)
            .bind(token.usage_count)
            .bind(token.last_used_at)
            .bind(token.revoked_at)
            .bind(token.revoked_by)
            .bind(&token.created_from)
            .bind(token.client_info.as_ref().map(Json))
            .bind(token.created_at)
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to insert api token")?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &[u8]) -> Result<Option<Token>> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE token_hash = $1");
        let row = sqlx::query(&query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to lookup api token by hash")?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Token>> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to lookup api token")?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<Token>> {
        let query = format!(
            "SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to list api tokens")?;
        rows.iter().map(token_from_row).collect()
    }

    async fn record_usage(&self, id: Uuid, at: OffsetDateTime) -> Result<Option<Token>> {
        let query = format!(
            "UPDATE api_tokens \
             SET usage_count = usage_count + 1, last_used_at = $2 \
             WHERE id = $1 AND is_active AND (expires_at IS NULL OR expires_at > $2) \
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .instrument(db_span!("UPDATE", query.as_str()))
            .await
            .context("failed to record api token usage")?;
        row.as_ref().map(token_from_row).transpose()
    }

    async fn deactivate(
        &self,
        id: Uuid,
        revocation: Option<Revocation>,
    ) -> Result<DeactivateOutcome> {
        let query = format!(
            "UPDATE api_tokens \
             SET is_active = FALSE, \
                 revoked_at = COALESCE($2, revoked_at), \
                 revoked_by = COALESCE($3, revoked_by) \
             WHERE id = $1 AND is_active \
             RETURNING {TOKEN_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(revocation.map(|r| r.at))
            .bind(revocation.map(|r| r.by))
            .fetch_optional(&self.pool)
            .instrument(db_span!("UPDATE", query.as_str()))
            .await
            .context("failed to deactivate api token")?;
        if let Some(row) = row {
            return Ok(DeactivateOutcome::Deactivated(token_from_row(&row)?));
        }

        let query = "SELECT revoked_at FROM api_tokens WHERE id = $1";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .context("failed to lookup api token")?;
        Ok(match row {
            None => DeactivateOutcome::NotFound,
            Some(row) => {
                let revoked_at: Option<OffsetDateTime> = row.try_get("revoked_at")?;
                if revoked_at.is_some() {
                    DeactivateOutcome::AlreadyRevoked
                } else {
                    DeactivateOutcome::AlreadyInactive
                }
            }
        })
    }
}

/// Connectivity check used by the health endpoint.
///
/// # Errors
/// Returns an error if no connection can be acquired or the ping fails.
pub async fn ping(pool: &PgPool) -> Result<()> {
    use sqlx::Connection;

    let acquire_span = tracing::info_span!(
        "db.acquire",
        db.system = "postgresql",
        db.operation = "ACQUIRE"
    );
    let mut conn = pool
        .acquire()
        .instrument(acquire_span)
        .await
        .context("failed to acquire database connection")?;
    let ping_span = tracing::info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
    conn.ping()
        .instrument(ping_span)
        .await
        .context("failed to ping database")
}
