//! Self-service API token lifecycle.
//!
//! The plaintext secret appears only in the create response.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    api::AppState,
    auth::AuthenticatedIdentity,
    client_info::ClientInfo,
    error::ApiError,
    middleware::RequestContext,
    token::Token,
};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateTokenRequest {
    pub name: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateTokenResponse {
    /// Shown once. Store it now; only its digest is kept.
    pub token: String,
    pub metadata: Token,
}

/// Shared by the self-service and admin create endpoints.
pub(super) async fn issue_token(
    state: &AppState,
    owner_id: Uuid,
    request: CreateTokenRequest,
    created_from: &str,
    client_info: ClientInfo,
) -> Result<(StatusCode, Json<CreateTokenResponse>), ApiError> {
    if request
        .expires_at
        .is_some_and(|expires_at| expires_at <= OffsetDateTime::now_utc())
    {
        return Err(ApiError::BadRequest(
            "expires_at must be in the future".to_string(),
        ));
    }
    let scopes = request
        .scopes
        .into_iter()
        .map(|scope| scope.trim().to_string())
        .filter(|scope| !scope.is_empty())
        .collect();

    let (plaintext, token) = state
        .services()
        .tokens
        .generate_token(
            owner_id,
            &request.name,
            request.expires_at,
            scopes,
            created_from,
            Some(client_info),
        )
        .await?;
    info!(token_id = %token.id, user_id = %owner_id, created_from, "api token issued");

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: plaintext,
            metadata: token,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/tokens",
    responses(
        (status = 200, description = "Tokens owned by the caller.", body = [Token]),
        (status = 401, description = "No valid credential."),
    ),
    tag = "tokens"
)]
pub async fn list_tokens(
    identity: AuthenticatedIdentity,
    state: Extension<Arc<AppState>>,
) -> Result<Json<Vec<Token>>, ApiError> {
    Ok(Json(
        state.services().tokens.list_tokens(identity.user_id).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/tokens",
    request_body = CreateTokenRequest,
    responses(
        (status = 201, description = "Token created; the secret is returned once.", body = CreateTokenResponse),
        (status = 400, description = "Empty name or expiry in the past."),
        (status = 401, description = "No valid credential."),
    ),
    tag = "tokens"
)]
pub async fn create_token(
    identity: AuthenticatedIdentity,
    context: RequestContext,
    state: Extension<Arc<AppState>>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), ApiError> {
    issue_token(
        &state,
        identity.user_id,
        request,
        "api",
        context.client_info,
    )
    .await
}

#[utoipa::path(
    get,
    path = "/api/tokens/{id}",
    params(("id" = Uuid, Path, description = "Token id")),
    responses(
        (status = 200, description = "Token metadata.", body = Token),
        (status = 401, description = "No valid credential."),
        (status = 404, description = "Unknown token or owned by someone else."),
    ),
    tag = "tokens"
)]
pub async fn get_token(
    Path(id): Path<Uuid>,
    identity: AuthenticatedIdentity,
    state: Extension<Arc<AppState>>,
) -> Result<Json<Token>, ApiError> {
    Ok(Json(
        state
            .services()
            .tokens
            .get_token(id, identity.user_id)
            .await?,
    ))
}

#[utoipa::path(
    delete,
    path = "/api/tokens/{id}",
    params(("id" = Uuid, Path, description = "Token id")),
    responses(
        (status = 204, description = "Token revoked."),
        (status = 401, description = "No valid credential."),
        (status = 403, description = "Token belongs to another user."),
        (status = 404, description = "Unknown token."),
        (status = 409, description = "Token already revoked or inactive."),
    ),
    tag = "tokens"
)]
pub async fn revoke_token(
    Path(id): Path<Uuid>,
    identity: AuthenticatedIdentity,
    state: Extension<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    state
        .services()
        .tokens
        .revoke_token(id, identity.user_id, identity.user_id)
        .await?;
    info!(token_id = %id, user_id = %identity.user_id, "api token revoked by owner");
    Ok(StatusCode::NO_CONTENT)
}
