//! Introspection of the caller's own identity and sessions.

use axum::{
    Json,
    extract::Extension,
    response::IntoResponse,
};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::{
    api::AppState,
    auth::AuthenticatedIdentity,
    client_info::ClientInfo,
    error::ApiError,
    middleware::RequestContext,
    session::Session,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub identity: AuthenticatedIdentity,
    /// Absent for Basic credentials, which carry no session.
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionSummary {
    pub provider: String,
    pub live: bool,
    /// The session presenting this request.
    pub current: bool,
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

impl SessionSummary {
    fn new(session: Session, current_token: Option<&str>, now: OffsetDateTime) -> Self {
        Self {
            live: session.is_live(now),
            current: current_token == Some(session.token.as_str()),
            provider: session.provider,
            created_at: session.created_at,
            valid_until: session.valid_until,
            last_activity: session.last_activity,
            closed_on: session.closed_on,
            client_info: session.client_info,
        }
    }
}

#[utoipa::path(
    get,
    path = "/auth/session",
    responses(
        (status = 200, description = "Identity resolved for this request.", body = SessionResponse),
        (status = 401, description = "No valid credential."),
    ),
    tag = "auth"
)]
pub async fn current_session(
    identity: AuthenticatedIdentity,
    context: RequestContext,
) -> impl IntoResponse {
    Json(SessionResponse {
        identity,
        valid_until: context.session.map(|session| session.valid_until),
    })
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    responses(
        (status = 200, description = "All sessions of the caller, in any state.", body = [SessionSummary]),
        (status = 401, description = "No valid credential."),
    ),
    tag = "auth"
)]
pub async fn list_sessions(
    identity: AuthenticatedIdentity,
    context: RequestContext,
    state: Extension<Arc<AppState>>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state
        .services()
        .sessions
        .find_sessions_by_user_id(identity.user_id)
        .await?;
    let current = context.session.as_ref().map(|session| session.token.as_str());
    let now = OffsetDateTime::now_utc();
    Ok(Json(
        sessions
            .into_iter()
            .map(|session| SessionSummary::new(session, current, now))
            .collect(),
    ))
}
