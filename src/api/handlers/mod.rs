pub mod admin_tokens;
pub mod check;
pub mod health;
pub mod login;
pub mod logout;
pub mod oauth;
pub mod session;
pub mod tokens;

use axum::http::HeaderMap;
use serde::Deserialize;
use utoipa::IntoParams;

use super::AppState;
use crate::session::cookie::request_is_tls;

/// `?redirect=/path` accepted by the login and logout entry points.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RedirectParams {
    /// Local path to return to; anything else falls back to `/`.
    pub redirect: Option<String>,
}

fn secure_cookies(headers: &HeaderMap, state: &AppState) -> bool {
    request_is_tls(headers, &state.settings().gateway_base_url)
}
