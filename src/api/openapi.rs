use super::handlers::{admin_tokens, check, health, login, logout, oauth, session, tokens};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Router that also drives the `OpenAPI` document.
///
/// Routes added outside (`OPTIONS /health`, config-driven check endpoints) are not
/// documented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(package_openapi())
        .routes(routes!(health::health))
        .routes(routes!(login::login))
        .routes(routes!(oauth::login_with_provider))
        .routes(routes!(oauth::callback))
        .routes(routes!(logout::logout))
        .routes(routes!(check::check))
        .routes(routes!(session::current_session))
        .routes(routes!(session::list_sessions))
        .routes(routes!(tokens::list_tokens, tokens::create_token))
        .routes(routes!(tokens::get_token, tokens::revoke_token))
        .routes(routes!(
            admin_tokens::list_user_tokens,
            admin_tokens::create_user_token
        ))
        .routes(routes!(admin_tokens::revoke_user_token));

    router.get_openapi_mut().tags = Some(vec![
        tag("auth", "Logins, delegated identity callback, logout and sessions"),
        tag("tokens", "Self-service API tokens"),
        tag("admin", "Administrator token management"),
        tag("health", "Liveness and dependency status"),
    ]);

    router
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn package_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(non_empty(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    // "Name <email>"; only the first of `;` separated authors is used.
    info.contact = env!("CARGO_PKG_AUTHORS")
        .split(';')
        .next()
        .and_then(non_empty)
        .map(|author| {
            let mut contact = Contact::new();
            match author.split_once('<') {
                Some((name, email)) => {
                    contact.name = non_empty(name).map(str::to_string);
                    contact.email = non_empty(email.trim_end_matches('>')).map(str::to_string);
                }
                None => contact.name = Some(author.to_string()),
            }
            contact
        });

    info.license = non_empty(env!("CARGO_PKG_LICENSE")).map(|spdx| {
        let mut license = License::new(spdx);
        license.identifier = Some(spdx.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

fn non_empty(value: &str) -> Option<&str> {
    Some(value.trim()).filter(|value| !value.is_empty())
}
