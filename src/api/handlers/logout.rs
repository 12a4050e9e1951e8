use axum::{
    extract::{Extension, Query},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{RedirectParams, secure_cookies};
use crate::{
    api::AppState,
    session::{cookie::clear_session_cookie, extract_session_token},
    utils::local_redirect_target,
};

pub const LOGOUT_CACHE_CONTROL: &str =
    "no-store, no-cache, must-revalidate, post-check=0, pre-check=0";

/// Logout never fails for the caller: it always redirects and clears the cookie.
#[utoipa::path(
    get,
    path = "/auth/logout",
    params(RedirectParams),
    responses(
        (status = 302, description = "Session closed (if any) and cookie cleared."),
    ),
    tag = "auth"
)]
pub async fn logout(
    Query(params): Query<RedirectParams>,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Response {
    match extract_session_token(&headers) {
        Some(token) => match state.services().sessions.end_session(&token).await {
            Ok(()) => info!("Session closed by logout"),
            Err(err) => warn!("Logout could not close session: {err}"),
        },
        None => warn!("Logout without a session cookie"),
    }

    let target = local_redirect_target(params.redirect.as_deref());
    let location = HeaderValue::from_str(&target).unwrap_or_else(|_| HeaderValue::from_static("/"));
    let mut response = (
        StatusCode::FOUND,
        [
            (LOCATION, location),
            (CACHE_CONTROL, HeaderValue::from_static(LOGOUT_CACHE_CONTROL)),
        ],
    )
        .into_response();

    match clear_session_cookie(secure_cookies(&headers, &state)) {
        Ok(cookie) => {
            response.headers_mut().insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build session cookie: {err}"),
    }
    response
}
