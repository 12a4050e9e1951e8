//! Request-scoped state passed explicitly between pipeline stages.
//!
//! The fingerprint stage creates the context; later stages take it out of the request,
//! work on it through `&mut`, and put it back before calling the next stage.

use axum::{
    extract::{FromRequestParts, Request},
    http::request::Parts,
};
use std::convert::Infallible;

use crate::{auth::AuthenticatedIdentity, client_info::ClientInfo, session::Session};

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub request_id: Option<String>,
    pub client_info: ClientInfo,
    pub session: Option<Session>,
    pub identity: Option<AuthenticatedIdentity>,
}

impl RequestContext {
    #[must_use]
    pub fn ip_address(&self) -> Option<&str> {
        self.client_info.ip_address.as_deref()
    }

    /// Attach a validated session; the identity is derived from it.
    pub fn attach_session(&mut self, session: Session) {
        self.identity = Some(AuthenticatedIdentity::from_session(&session));
        self.session = Some(session);
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

#[must_use]
pub fn take_context(request: &mut Request) -> RequestContext {
    request
        .extensions_mut()
        .remove::<RequestContext>()
        .unwrap_or_default()
}

pub fn put_context(request: &mut Request, context: RequestContext) {
    request.extensions_mut().insert(context);
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_default())
    }
}
