//! Password login: verifies an argon2 hash and mints a session cookie.

use axum::{
    Json,
    extract::Extension,
    http::{
        HeaderMap, HeaderValue,
        header::{CACHE_CONTROL, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use super::secure_cookies;
use crate::{
    api::AppState,
    auth::{basic::BASIC_SOURCE, password::spawn_verify},
    error::ApiError,
    middleware::RequestContext,
    session::cookie::session_cookie,
};

/// Provider recorded on sessions of administrators.
pub const ADMIN_PROVIDER: &str = "admin";

#[derive(Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub provider: String,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_until: OffsetDateTime,
}

#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session created; the cookie is set on the response.", body = LoginResponse),
        (status = 401, description = "Unknown user or wrong password."),
    ),
    tag = "auth"
)]
pub async fn login(
    state: Extension<Arc<AppState>>,
    context: RequestContext,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let username = request.username.trim();
    let user = state.services().users.find_by_username(username).await?;
    let stored_hash = user.as_ref().and_then(|user| user.password_hash.clone());
    let verified = spawn_verify(stored_hash, request.password).await;
    let Some(user) = user.as_ref().filter(|_| verified) else {
        debug!(%username, "password login rejected");
        tokio::time::sleep(state.settings().basic_failure_delay).await;
        return Err(ApiError::Unauthenticated);
    };

    let provider = if user.is_admin {
        ADMIN_PROVIDER
    } else {
        BASIC_SOURCE
    };
    let ttl = state.settings().session_ttl;
    let session = state
        .services()
        .sessions
        .new_session(&context.client_info, user, provider, ttl)
        .await?;
    let cookie = session_cookie(
        &session.token,
        ttl.whole_seconds(),
        secure_cookies(&headers, &state),
    )
    .map_err(|err| ApiError::Internal(err.into()))?;

    info!(user_id = %user.id, provider, "password login");

    let body = LoginResponse {
        user_id: user.id,
        username: user.username.clone(),
        provider: provider.to_string(),
        valid_until: session.valid_until,
    };
    Ok((
        [
            (SET_COOKIE, cookie),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
        Json(body),
    )
        .into_response())
}
