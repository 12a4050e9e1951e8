//! Delegated identity (`OAuth2` authorization-code flow).
//!
//! Flow Overview:
//! 1) `authenticate` short-circuits on a live session minted by this provider or an API
//!    token view already resolved by the identity stage, or on a bearer credential (API
//!    token, or provider access token checked at the identity endpoint).
//! 2) Browser requests without a credential are redirected to the provider with a fresh
//!    CSRF `state`, remembered server-side and in a provider-scoped cookie.
//! 3) The callback takes the pending state (single use), rejects provider errors and
//!    mismatches, exchanges the code, resolves the identity at the provider, and only
//!    then creates a session.

pub mod flow;
pub mod provider;

use axum::{
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{ACCEPT, CACHE_CONTROL, LOCATION, SET_COOKIE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, error, warn};
use utoipa::IntoParams;

use self::{
    flow::{DEFAULT_FLOW_TTL, FlowStateStore, OAuthFlowState, extract_state_cookie, state_cookie},
    provider::OAuthProvider,
};
use super::{AuthRejection, AuthSettings, AuthenticatedIdentity, IdentityServices};
use crate::{
    client_info::ClientInfo,
    error::ApiError,
    middleware::RequestContext,
    session::{Session, TOKEN_AUTH_PROVIDER, cookie::request_is_tls, extract_bearer_token},
    store::LinkOutcome,
    token::TOKEN_PREFIX,
    utils::{generate_random_token, local_redirect_target},
};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("missing or mismatched state")]
    InvalidState,
    #[error("provider returned an error: {0}")]
    Denied(String),
    #[error("callback is missing the authorization code")]
    MissingCode,
    #[error("code exchange failed: {0}")]
    Exchange(String),
    #[error("provider access token is invalid or expired")]
    InvalidAccessToken,
    #[error("identity lookup failed: {0}")]
    Identity(String),
    #[error("identity cannot be linked to an existing account")]
    IdentityConflict,
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProviderError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidState | Self::Denied(_) | Self::MissingCode => StatusCode::BAD_REQUEST,
            Self::Exchange(_) | Self::InvalidAccessToken | Self::Identity(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::IdentityConflict => StatusCode::CONFLICT,
            Self::Transport(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidState => "Invalid or expired login state",
            Self::Denied(_) => "Login was denied by the identity provider",
            Self::MissingCode => "Missing authorization code",
            Self::Exchange(_) | Self::InvalidAccessToken | Self::Identity(_) => {
                "Identity provider rejected the login"
            }
            Self::IdentityConflict => "Identity cannot be linked to an existing account",
            Self::Transport(_) | Self::Internal(_) => "Identity provider unavailable",
        }
    }
}

/// Query parameters the provider appends to the callback URL.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

pub struct OAuthAuthenticator {
    provider: OAuthProvider,
    flows: Arc<FlowStateStore>,
    services: IdentityServices,
    settings: Arc<AuthSettings>,
}

impl OAuthAuthenticator {
    #[must_use]
    pub fn new(
        provider: OAuthProvider,
        flows: Arc<FlowStateStore>,
        services: IdentityServices,
        settings: Arc<AuthSettings>,
    ) -> Self {
        Self {
            provider,
            flows,
            services,
            settings,
        }
    }

    #[must_use]
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// # Errors
    /// `Unauthorized` for rejected credentials or non-browser requests, `Redirect` to
    /// start the flow.
    pub async fn authenticate(
        &self,
        parts: &Parts,
        context: &mut RequestContext,
    ) -> Result<(), AuthRejection> {
        let now = OffsetDateTime::now_utc();
        let name = self.provider.name();

        // A token view was already counted by the identity stage.
        if let Some(session) = &context.session
            && (session.provider == name || session.provider == TOKEN_AUTH_PROVIDER)
            && session.is_live(now)
        {
            context.identity = Some(AuthenticatedIdentity::from_session(session));
            return Ok(());
        }
        if context.session.is_none() {
            let ip_address = context.ip_address().map(str::to_string);
            match self
                .services
                .sessions
                .validate_session(&parts.headers, ip_address.as_deref())
                .await
            {
                Ok(Some(session)) if session.provider == name => {
                    context.attach_session(session);
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => {
                    error!("Failed to validate session: {err:#}");
                    return Err(ApiError::from(err).into());
                }
            }
        }

        if let Some(bearer) = extract_bearer_token(&parts.headers) {
            return self.authenticate_bearer(&parts.headers, &bearer, context).await;
        }

        if is_callback_path(parts.uri.path()) || wants_machine_response(parts) {
            return Err(AuthRejection::Unauthorized { challenge: None });
        }

        let original_url = parts
            .uri
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str());
        let secure = request_is_tls(&parts.headers, &self.settings.gateway_base_url);
        Err(AuthRejection::Redirect(
            self.begin(original_url, secure).await?,
        ))
    }

    async fn authenticate_bearer(
        &self,
        headers: &HeaderMap,
        bearer: &str,
        context: &mut RequestContext,
    ) -> Result<(), AuthRejection> {
        let unauthorized = AuthRejection::Unauthorized { challenge: None };

        if bearer.starts_with(TOKEN_PREFIX) {
            return match self
                .services
                .sessions
                .validate_token_auth(headers, &self.services.tokens)
                .await
            {
                Ok(Some(view)) => {
                    context.attach_session(view);
                    Ok(())
                }
                Ok(None) => Err(unauthorized),
                Err(err) => {
                    debug!("API token rejected: {err}");
                    Err(ApiError::from(err).into())
                }
            };
        }

        let identity = match self.provider.fetch_identity(bearer).await {
            Ok(identity) => identity,
            Err(err) => {
                debug!(provider = self.provider.name(), "provider access token rejected: {err}");
                return Err(unauthorized);
            }
        };
        match self.services.users.find_or_create_external(&identity).await {
            Ok(LinkOutcome::Linked(user)) => {
                context.identity = Some(AuthenticatedIdentity::from_user(&user, self.provider.name()));
                Ok(())
            }
            Ok(LinkOutcome::Conflict) => Err(ApiError::from(ProviderError::IdentityConflict).into()),
            Err(err) => Err(ApiError::Internal(err).into()),
        }
    }

    /// Issue the provider redirect. `original_url` is reduced to a local path.
    ///
    /// # Errors
    /// Returns `ApiError::Internal` if the state cannot be generated or the cookie built.
    pub async fn begin(&self, original_url: &str, secure: bool) -> Result<Response, ApiError> {
        let state = generate_random_token::<32>()?;
        let name = self.provider.name();
        self.flows
            .store(OAuthFlowState {
                state: state.clone(),
                original_url: local_redirect_target(Some(original_url)),
                provider: name.to_string(),
            })
            .await;

        let location = HeaderValue::from_str(self.provider.authorization_url(&state).as_str())
            .map_err(|err| ApiError::Internal(err.into()))?;
        let cookie = state_cookie(name, &state, DEFAULT_FLOW_TTL, secure)
            .map_err(|err| ApiError::Internal(err.into()))?;

        let mut response = StatusCode::FOUND.into_response();
        let headers = response.headers_mut();
        headers.insert(LOCATION, location);
        headers.insert(SET_COOKIE, cookie);
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        debug!(provider = name, "delegated login started");
        Ok(response)
    }

    /// Complete the flow. Returns the new session and the post-login redirect target.
    ///
    /// The pending state is consumed before any other check, so a state value can never
    /// be replayed.
    ///
    /// # Errors
    /// Any `ProviderError`; no session exists when an error is returned.
    pub async fn complete(
        &self,
        params: &CallbackParams,
        headers: &HeaderMap,
        client_info: &ClientInfo,
    ) -> Result<(Session, String), ProviderError> {
        let name = self.provider.name();

        let pending = match extract_state_cookie(headers, name) {
            Some(cookie_state) => self.flows.take(name, &cookie_state).await,
            None => None,
        };
        let flow = match (pending, params.state.as_deref()) {
            (Some(flow), Some(state)) if flow.state == state => flow,
            _ => {
                warn!(provider = name, "callback state missing or mismatched");
                return Err(ProviderError::InvalidState);
            }
        };

        if let Some(error) = &params.error {
            let description = params.error_description.as_deref().unwrap_or_default();
            return Err(ProviderError::Denied(format!("{error} {description}").trim().to_string()));
        }
        let code = params
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or(ProviderError::MissingCode)?;

        let access_token = self.provider.exchange_code(code).await?;
        let identity = self.provider.fetch_identity(&access_token).await?;

        let user = match self.services.users.find_or_create_external(&identity).await? {
            LinkOutcome::Linked(user) => user,
            LinkOutcome::Conflict => return Err(ProviderError::IdentityConflict),
        };

        let session = self
            .services
            .sessions
            .new_session(client_info, &user, name, self.settings.session_ttl)
            .await
            .map_err(|err| ProviderError::Internal(err.into()))?;
        debug!(provider = name, user_id = %user.id, "delegated login completed");

        Ok((session, flow.original_url))
    }
}

fn is_callback_path(path: &str) -> bool {
    path.starts_with("/auth/callback/")
}

/// Non-browser callers get 401 instead of a redirect they cannot follow.
fn wants_machine_response(parts: &Parts) -> bool {
    if parts.method != Method::GET && parts.method != Method::HEAD {
        return true;
    }
    if parts
        .headers
        .get("x-requested-with")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("xmlhttprequest"))
    {
        return true;
    }
    parts
        .headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json") && !accept.contains("text/html"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::manager::AuthSettings,
        config::ProviderConfig,
        session::{SESSION_COOKIE_NAME, SessionStore},
        store::{
            CreateUserOutcome, NewUser, UserRepository,
            memory::{MemorySessionRepository, MemoryTokenRepository, MemoryUserRepository},
        },
        token::TokenService,
    };
    use anyhow::{Result, anyhow};
    use axum::http::{Request, header::COOKIE};
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    struct Fixture {
        oauth: OAuthAuthenticator,
        flows: Arc<FlowStateStore>,
        services: IdentityServices,
    }

    fn fixture(base: &str) -> Result<Fixture> {
        let users = Arc::new(MemoryUserRepository::default());
        let tokens = Arc::new(TokenService::new(
            Arc::new(MemoryTokenRepository::default()),
            users.clone(),
        ));
        let services = IdentityServices {
            users,
            sessions: Arc::new(SessionStore::new(Arc::new(MemorySessionRepository::default()))),
            tokens,
        };
        let config = ProviderConfig {
            name: "github".to_string(),
            client_id: "client-id".to_string(),
            client_secret: SecretString::from("client-secret".to_string()),
            authorize_url: format!("{base}/authorize"),
            token_url: format!("{base}/token"),
            userinfo_url: format!("{base}/user"),
            scopes: Vec::new(),
        };
        let provider = OAuthProvider::from_config(&config, "http://gw.test", reqwest::Client::new())
            .map_err(anyhow::Error::msg)?;
        let flows = Arc::new(FlowStateStore::default());
        let settings = Arc::new(AuthSettings {
            gateway_base_url: "http://gw.test".to_string(),
            ..AuthSettings::default()
        });
        Ok(Fixture {
            oauth: OAuthAuthenticator::new(provider, flows.clone(), services.clone(), settings),
            flows,
            services,
        })
    }

    async fn mount_provider(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "gho_ok", "token_type": "bearer"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7,
                "login": "octocat",
                "email": "octocat@example.com"
            })))
            .mount(server)
            .await;
    }

    fn request_parts(uri: &str, headers: &[(&str, &str)]) -> Result<Parts> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Ok(builder.body(())?.into_parts().0)
    }

    fn callback_headers(state: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("tg_oauth_state_github={state}"))?,
        );
        Ok(headers)
    }

    async fn start_flow(fx: &Fixture, original: &str) -> Result<String> {
        let response = fx.oauth.begin(original, false).await?;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| anyhow!("missing location"))?
            .to_str()?;
        let url = url::Url::parse(location)?;
        url.query_pairs()
            .find(|(key, _)| key == "state")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| anyhow!("missing state"))
    }

    #[tokio::test]
    async fn browser_request_is_redirected_with_state_cookie() -> Result<()> {
        let fx = fixture("https://idp.example.com")?;
        let parts = request_parts("/docs/page?x=1", &[("accept", "text/html")])?;
        let mut context = RequestContext::default();

        let Err(AuthRejection::Redirect(response)) = fx.oauth.authenticate(&parts, &mut context).await
        else {
            return Err(anyhow!("expected a redirect"));
        };
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response
            .headers()
            .get(LOCATION)
            .ok_or_else(|| anyhow!("missing location"))?
            .to_str()?;
        assert!(location.starts_with("https://idp.example.com/authorize?"));
        let cookie = response
            .headers()
            .get(SET_COOKIE)
            .ok_or_else(|| anyhow!("missing state cookie"))?
            .to_str()?;
        assert!(cookie.starts_with("tg_oauth_state_github="));
        assert_eq!(fx.flows.pending_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn machine_requests_and_callbacks_get_401() -> Result<()> {
        let fx = fixture("https://idp.example.com")?;
        let mut context = RequestContext::default();

        for parts in [
            request_parts("/api/data", &[("accept", "application/json")])?,
            request_parts("/auth/callback/github", &[])?,
            request_parts("/api/data", &[("x-requested-with", "XMLHttpRequest")])?,
        ] {
            assert!(matches!(
                fx.oauth.authenticate(&parts, &mut context).await,
                Err(AuthRejection::Unauthorized { .. })
            ));
        }
        assert_eq!(fx.flows.pending_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn callback_creates_session_and_returns_original_url() -> Result<()> {
        let server = MockServer::start().await;
        mount_provider(&server).await;
        let fx = fixture(&server.uri())?;
        let state = start_flow(&fx, "/docs/page").await?;

        let params = CallbackParams {
            code: Some("good-code".to_string()),
            state: Some(state.clone()),
            ..CallbackParams::default()
        };
        let (session, redirect) = fx
            .oauth
            .complete(&params, &callback_headers(&state)?, &ClientInfo::default())
            .await?;
        assert_eq!(redirect, "/docs/page");
        assert_eq!(session.provider, "github");
        assert_eq!(session.username, "octocat");

        assert!(matches!(
            fx.oauth
                .complete(&params, &callback_headers(&state)?, &ClientInfo::default())
                .await,
            Err(ProviderError::InvalidState)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_state_is_rejected_regardless_of_code() -> Result<()> {
        let server = MockServer::start().await;
        mount_provider(&server).await;
        let fx = fixture(&server.uri())?;
        let state = start_flow(&fx, "/").await?;

        let params = CallbackParams {
            code: Some("good-code".to_string()),
            state: Some("forged".to_string()),
            ..CallbackParams::default()
        };
        assert!(matches!(
            fx.oauth
                .complete(&params, &callback_headers(&state)?, &ClientInfo::default())
                .await,
            Err(ProviderError::InvalidState)
        ));
        assert_eq!(fx.flows.pending_count().await, 0, "state is consumed on mismatch");
        Ok(())
    }

    #[tokio::test]
    async fn provider_error_parameter_is_rejected() -> Result<()> {
        let fx = fixture("https://idp.example.com")?;
        let state = start_flow(&fx, "/").await?;
        let params = CallbackParams {
            state: Some(state.clone()),
            error: Some("access_denied".to_string()),
            ..CallbackParams::default()
        };
        assert!(matches!(
            fx.oauth
                .complete(&params, &callback_headers(&state)?, &ClientInfo::default())
                .await,
            Err(ProviderError::Denied(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn failed_exchange_creates_no_session() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;
        let fx = fixture(&server.uri())?;
        let state = start_flow(&fx, "/").await?;
        let params = CallbackParams {
            code: Some("bad".to_string()),
            state: Some(state.clone()),
            ..CallbackParams::default()
        };
        assert!(matches!(
            fx.oauth
                .complete(&params, &callback_headers(&state)?, &ClientInfo::default())
                .await,
            Err(ProviderError::Exchange(_))
        ));
        assert!(fx.services.users.find_by_username("octocat").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn existing_provider_session_short_circuits() -> Result<()> {
        let server = MockServer::start().await;
        mount_provider(&server).await;
        let fx = fixture(&server.uri())?;
        let state = start_flow(&fx, "/").await?;
        let params = CallbackParams {
            code: Some("good-code".to_string()),
            state: Some(state.clone()),
            ..CallbackParams::default()
        };
        let (session, _) = fx
            .oauth
            .complete(&params, &callback_headers(&state)?, &ClientInfo::default())
            .await?;

        let cookie = format!("{SESSION_COOKIE_NAME}={}", session.token);
        let parts = request_parts("/docs", &[("cookie", cookie.as_str())])?;
        let mut context = RequestContext::default();
        fx.oauth
            .authenticate(&parts, &mut context)
            .await
            .map_err(|rejection| anyhow!("rejected: {rejection:?}"))?;
        assert_eq!(
            context.identity.map(|identity| identity.source),
            Some("github".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn provider_access_token_is_verified_at_identity_endpoint() -> Result<()> {
        let server = MockServer::start().await;
        mount_provider(&server).await;
        let fx = fixture(&server.uri())?;

        let parts = request_parts("/api/data", &[("authorization", "Bearer gho_ok")])?;
        let mut context = RequestContext::default();
        fx.oauth
            .authenticate(&parts, &mut context)
            .await
            .map_err(|rejection| anyhow!("rejected: {rejection:?}"))?;
        assert_eq!(
            context.identity.map(|identity| identity.username),
            Some("octocat".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn resolved_api_token_is_not_counted_twice() -> Result<()> {
        let fx = fixture("https://idp.example.com")?;
        let CreateUserOutcome::Created(alice) = fx
            .services
            .users
            .create(NewUser {
                username: "alice".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: None,
                is_admin: false,
            })
            .await?
        else {
            return Err(anyhow!("user should be created"));
        };
        let (plaintext, token) = fx
            .services
            .tokens
            .generate_token(alice.id, "CI", None, Vec::new(), "self", None)
            .await?;
        let bearer = format!("Bearer {plaintext}");
        let parts = request_parts("/sso/page", &[("authorization", bearer.as_str())])?;

        let mut context = RequestContext::default();
        let view = fx
            .services
            .sessions
            .validate_token_auth(&parts.headers, &fx.services.tokens)
            .await?
            .ok_or_else(|| anyhow!("bearer token should validate"))?;
        context.attach_session(view);

        fx.oauth
            .authenticate(&parts, &mut context)
            .await
            .map_err(|rejection| anyhow!("rejected: {rejection:?}"))?;
        assert_eq!(
            context.identity.map(|identity| identity.user_id),
            Some(alice.id)
        );
        let stored = fx.services.tokens.get_token(token.id, alice.id).await?;
        assert_eq!(stored.usage_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_api_token_is_rejected_without_redirect() -> Result<()> {
        let fx = fixture("https://idp.example.com")?;
        let parts = request_parts("/docs", &[("authorization", "Bearer tg_pat_unknown")])?;
        let mut context = RequestContext::default();
        let rejection = fx
            .oauth
            .authenticate(&parts, &mut context)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected rejection"))?;
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[test]
    fn provider_errors_map_by_stage() {
        assert_eq!(ProviderError::InvalidState.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ProviderError::InvalidAccessToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ProviderError::Internal(anyhow!("db down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ProviderError::Internal(anyhow!("db down")).public_message(),
            "Identity provider unavailable"
        );
    }
}
