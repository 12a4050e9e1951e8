use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};

use crate::middleware::RequestContext;

pub const USER_ID_HEADER: &str = "x-auth-user-id";
pub const USERNAME_HEADER: &str = "x-auth-username";
pub const SOURCE_HEADER: &str = "x-auth-source";

/// Subrequest target for reverse proxies: 204 once the route chain let the request
/// through, with the resolved identity (if any) in `X-Auth-*` headers.
#[utoipa::path(
    get,
    path = "/auth/check",
    responses(
        (status = 204, description = "Caller is authenticated; identity in X-Auth-* headers."),
        (status = 401, description = "No valid credential."),
    ),
    tag = "auth"
)]
pub async fn check(context: RequestContext) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let Some(identity) = context.identity else {
        return response;
    };
    let headers = response.headers_mut();
    for (name, value) in [
        (USER_ID_HEADER, identity.user_id.to_string()),
        (USERNAME_HEADER, identity.username),
        (SOURCE_HEADER, identity.source),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    response
}
