//! HTTP-facing error taxonomy.
//!
//! Services return typed failures; this module is the single place where they are
//! mapped to status codes. Internal detail is logged and never echoed to the caller.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, warn};

use crate::{auth::oauth::ProviderError, session::SessionError, token::TokenError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthenticated,
    #[error("Forbidden")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Provider(err) => err.status(),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            Self::Provider(err) => err.public_message().to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(err) => error!("Internal error: {err:#}"),
            Self::Provider(err) => warn!("Identity provider failure: {err}"),
            _ => {}
        }
        let status = self.status();
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidFormat
            | TokenError::Unknown
            | TokenError::Inactive
            | TokenError::Expired => Self::Unauthenticated,
            TokenError::NotFound => Self::NotFound("Token"),
            TokenError::UserNotFound => Self::NotFound("User"),
            TokenError::NotOwner => Self::Forbidden,
            TokenError::InvalidName => Self::BadRequest("Token name must not be empty".to_string()),
            TokenError::AlreadyRevoked => Self::Conflict("Token already revoked".to_string()),
            TokenError::AlreadyInactive => Self::Conflict("Token already inactive".to_string()),
            TokenError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => Self::NotFound("Session"),
            SessionError::AlreadyClosed => Self::Conflict("Session already closed".to_string()),
            SessionError::Internal(err) => Self::Internal(err),
        }
    }
}
