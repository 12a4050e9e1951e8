//! Administrator variants of the token endpoints, acting on another user's tokens.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::tokens::{CreateTokenRequest, CreateTokenResponse, issue_token};
use crate::{
    api::AppState,
    auth::AuthenticatedIdentity,
    error::ApiError,
    middleware::RequestContext,
    token::Token,
};

fn require_admin(identity: &AuthenticatedIdentity) -> Result<(), ApiError> {
    if identity.is_admin {
        Ok(())
    } else {
        warn!(user_id = %identity.user_id, "non-admin attempted an admin token operation");
        Err(ApiError::Forbidden)
    }
}

#[utoipa::path(
    get,
    path = "/api/admin/users/{user_id}/tokens",
    params(("user_id" = Uuid, Path, description = "Target user")),
    responses(
        (status = 200, description = "Tokens of the target user.", body = [Token]),
        (status = 401, description = "No valid credential."),
        (status = 403, description = "Caller is not an administrator."),
        (status = 404, description = "Target user does not exist."),
    ),
    tag = "admin"
)]
pub async fn list_user_tokens(
    Path(user_id): Path<Uuid>,
    identity: AuthenticatedIdentity,
    state: Extension<Arc<AppState>>,
) -> Result<Json<Vec<Token>>, ApiError> {
    require_admin(&identity)?;
    Ok(Json(state.services().tokens.list_tokens(user_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/admin/users/{user_id}/tokens",
    params(("user_id" = Uuid, Path, description = "Target user")),
    request_body = CreateTokenRequest,
    responses(
        (status = 201, description = "Token created on behalf of the user.", body = CreateTokenResponse),
        (status = 400, description = "Empty name or expiry in the past."),
        (status = 401, description = "No valid credential."),
        (status = 403, description = "Caller is not an administrator."),
        (status = 404, description = "Target user does not exist."),
    ),
    tag = "admin"
)]
pub async fn create_user_token(
    Path(user_id): Path<Uuid>,
    identity: AuthenticatedIdentity,
    context: RequestContext,
    state: Extension<Arc<AppState>>,
    Json(request): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>), ApiError> {
    require_admin(&identity)?;
    issue_token(&state, user_id, request, "admin", context.client_info).await
}

#[utoipa::path(
    delete,
    path = "/api/admin/users/{user_id}/tokens/{id}",
    params(
        ("user_id" = Uuid, Path, description = "Token owner"),
        ("id" = Uuid, Path, description = "Token id")
    ),
    responses(
        (status = 204, description = "Token revoked by an administrator."),
        (status = 401, description = "No valid credential."),
        (status = 403, description = "Caller is not an administrator."),
        (status = 404, description = "Unknown user, or the token is not theirs."),
        (status = 409, description = "Token already revoked or inactive."),
    ),
    tag = "admin"
)]
pub async fn revoke_user_token(
    Path((user_id, id)): Path<(Uuid, Uuid)>,
    identity: AuthenticatedIdentity,
    state: Extension<Arc<AppState>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&identity)?;
    if state.services().users.find_by_id(user_id).await?.is_none() {
        return Err(ApiError::NotFound("User"));
    }
    state
        .services()
        .tokens
        .revoke_token_as_admin(id, user_id, identity.user_id)
        .await?;
    info!(token_id = %id, owner_id = %user_id, admin_id = %identity.user_id, "api token revoked by admin");
    Ok(StatusCode::NO_CONTENT)
}
