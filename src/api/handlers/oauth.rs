//! Delegated login entry point and provider callback.

use axum::{
    extract::{Extension, Path, Query},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::error;

use super::{RedirectParams, secure_cookies};
use crate::{
    api::AppState,
    auth::oauth::{CallbackParams, flow::clear_state_cookie},
    error::ApiError,
    middleware::RequestContext,
    session::{Session, cookie::session_cookie},
    utils::local_redirect_target,
};

#[utoipa::path(
    get,
    path = "/auth/login/{provider}",
    params(
        ("provider" = String, Path, description = "Configured identity provider"),
        RedirectParams
    ),
    responses(
        (status = 302, description = "Redirect to the provider authorization endpoint."),
        (status = 404, description = "Provider is not configured."),
    ),
    tag = "auth"
)]
pub async fn login_with_provider(
    Path(provider): Path<String>,
    Query(params): Query<RedirectParams>,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let oauth = state
        .auth
        .provider(&provider)
        .ok_or(ApiError::NotFound("Provider"))?;
    oauth
        .begin(
            &local_redirect_target(params.redirect.as_deref()),
            secure_cookies(&headers, &state),
        )
        .await
}

#[utoipa::path(
    get,
    path = "/auth/callback/{provider}",
    params(
        ("provider" = String, Path, description = "Configured identity provider"),
        CallbackParams
    ),
    responses(
        (status = 302, description = "Session created; redirect to the originally requested URL."),
        (status = 400, description = "Missing or mismatched state, provider error, or missing code."),
        (status = 401, description = "Code exchange or identity lookup rejected."),
        (status = 404, description = "Provider is not configured."),
        (status = 409, description = "Identity is linked to another account."),
    ),
    tag = "auth"
)]
pub async fn callback(
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
    context: RequestContext,
    state: Extension<Arc<AppState>>,
) -> Response {
    let Some(oauth) = state.auth.provider(&provider) else {
        return ApiError::NotFound("Provider").into_response();
    };
    let secure = secure_cookies(&headers, &state);

    let mut response = match oauth.complete(&params, &headers, &context.client_info).await {
        Ok((session, target)) => session_redirect(&session, &target, &state, secure),
        Err(err) => ApiError::Provider(err).into_response(),
    };

    // The state is single use whatever the outcome.
    match clear_state_cookie(&provider, secure) {
        Ok(cookie) => {
            response.headers_mut().append(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build state cookie: {err}"),
    }
    response
}

fn session_redirect(session: &Session, target: &str, state: &AppState, secure: bool) -> Response {
    let cookie = match session_cookie(
        &session.token,
        state.settings().session_ttl.whole_seconds(),
        secure,
    ) {
        Ok(cookie) => cookie,
        Err(err) => return ApiError::Internal(err.into()).into_response(),
    };
    let location = HeaderValue::from_str(target).unwrap_or_else(|_| HeaderValue::from_static("/"));
    (
        StatusCode::FOUND,
        [
            (LOCATION, location),
            (SET_COOKIE, cookie),
            (CACHE_CONTROL, HeaderValue::from_static("no-store")),
        ],
    )
        .into_response()
}
