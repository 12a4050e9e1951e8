//! Authenticator family.
//!
//! A route's authentication config resolves (through [`manager::AuthManager`]) to one
//! [`Authenticator`] variant. Each variant answers the same question: does this request
//! carry a valid identity, and if not, what challenge or redirect should be returned.
//! On success the identity is written into the explicit [`RequestContext`].

pub mod any;
pub mod basic;
pub mod manager;
pub mod oauth;
pub mod password;

use axum::{
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header::WWW_AUTHENTICATE, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::{fmt, str::FromStr, sync::Arc};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::RequestContext,
    session::{Session, SessionStore},
    store::{User, UserRepository},
    token::TokenService,
};

pub use basic::BasicAuthenticator;
pub use manager::{AuthConfigError, AuthManager, AuthSettings};
pub use oauth::OAuthAuthenticator;

/// Identity resolved for one request. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct AuthenticatedIdentity {
    pub user_id: Uuid,
    pub username: String,
    /// `basic`, `admin`, `token_auth`, or a delegated provider name.
    pub source: String,
    pub is_admin: bool,
}

impl AuthenticatedIdentity {
    #[must_use]
    pub fn from_session(session: &Session) -> Self {
        Self {
            user_id: session.user_id,
            username: session.username.clone(),
            source: session.provider.clone(),
            is_admin: session.is_admin,
        }
    }

    #[must_use]
    pub fn from_user(user: &User, source: &str) -> Self {
        Self {
            user_id: user.id,
            username: user.username.clone(),
            source: source.to_string(),
            is_admin: user.is_admin,
        }
    }
}

/// Handlers take `AuthenticatedIdentity` as an argument to require a caller.
impl<S> FromRequestParts<S> for AuthenticatedIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .and_then(|context| context.identity.clone())
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    OAuth2,
    Any,
}

impl FromStr for AuthMethod {
    type Err = AuthConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "oauth2" => Ok(Self::OAuth2),
            "any" => Ok(Self::Any),
            _ => Err(AuthConfigError::UnknownMethod(value.to_string())),
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Basic => "basic",
            Self::OAuth2 => "oauth2",
            Self::Any => "any",
        })
    }
}

/// Why a request was not let through.
#[derive(Debug)]
pub enum AuthRejection {
    /// 401, optionally with a `WWW-Authenticate` challenge.
    Unauthorized { challenge: Option<HeaderValue> },
    Forbidden,
    /// Start of the delegated flow; carries the provider redirect and state cookie.
    Redirect(Response),
    Error(ApiError),
}

impl From<ApiError> for AuthRejection {
    fn from(err: ApiError) -> Self {
        Self::Error(err)
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized { challenge } => {
                let mut response = ApiError::Unauthenticated.into_response();
                if let Some(challenge) = challenge {
                    response.headers_mut().insert(WWW_AUTHENTICATE, challenge);
                }
                response
            }
            Self::Forbidden => ApiError::Forbidden.into_response(),
            Self::Redirect(response) => response,
            Self::Error(err) => err.into_response(),
        }
    }
}

impl AuthRejection {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Redirect(response) => response.status(),
            Self::Error(err) => err.status(),
        }
    }
}

/// Shared collaborators every authenticator may consult.
#[derive(Clone)]
pub struct IdentityServices {
    pub users: Arc<dyn UserRepository>,
    pub sessions: Arc<SessionStore>,
    pub tokens: Arc<TokenService>,
}

#[derive(Clone)]
pub enum Authenticator {
    Basic(Arc<BasicAuthenticator>),
    OAuth2(Arc<OAuthAuthenticator>),
    Any,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OAuth2(oauth) => write!(f, "Authenticator::OAuth2({})", oauth.provider_name()),
            other => write!(f, "Authenticator::{}", other.method()),
        }
    }
}

impl Authenticator {
    #[must_use]
    pub fn method(&self) -> AuthMethod {
        match self {
            Self::Basic(_) => AuthMethod::Basic,
            Self::OAuth2(_) => AuthMethod::OAuth2,
            Self::Any => AuthMethod::Any,
        }
    }

    /// Grant the request (identity written into `context`) or reject it.
    ///
    /// # Errors
    /// Returns the `AuthRejection` the route stage turns into a response.
    pub async fn authenticate(
        &self,
        parts: &Parts,
        context: &mut RequestContext,
    ) -> Result<(), AuthRejection> {
        match self {
            Self::Basic(basic) => basic.authenticate(parts, context).await,
            Self::OAuth2(oauth) => oauth.authenticate(parts, context).await,
            Self::Any => any::authenticate(context),
        }
    }
}
