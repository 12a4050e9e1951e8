//! Outbound calls to a delegated identity provider: code exchange and identity endpoint.

use reqwest::{Client, header::ACCEPT};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{Instrument, info_span};
use url::Url;

use super::ProviderError;
use crate::{config::ProviderConfig, store::ExternalIdentity};

pub struct OAuthProvider {
    name: String,
    client_id: String,
    client_secret: SecretString,
    authorize_url: Url,
    token_url: Url,
    userinfo_url: Url,
    scopes: Vec<String>,
    redirect_uri: String,
    client: Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

impl std::fmt::Debug for OAuthProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProvider")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("authorize_url", &self.authorize_url.as_str())
            .finish_non_exhaustive()
    }
}

impl OAuthProvider {
    /// Build a provider from its configuration. Called at registration time.
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub fn from_config(
        config: &ProviderConfig,
        gateway_base_url: &str,
        client: Client,
    ) -> Result<Self, String> {
        if config.client_id.trim().is_empty() {
            return Err("client_id is empty".to_string());
        }
        if config.client_secret.expose_secret().trim().is_empty() {
            return Err("client_secret is empty".to_string());
        }
        let parse = |field: &str, value: &str| {
            Url::parse(value).map_err(|err| format!("{field} is not a valid URL: {err}"))
        };

        Ok(Self {
            name: config.name.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            authorize_url: parse("authorize_url", &config.authorize_url)?,
            token_url: parse("token_url", &config.token_url)?,
            userinfo_url: parse("userinfo_url", &config.userinfo_url)?,
            scopes: config.scopes.clone(),
            redirect_uri: format!(
                "{}/auth/callback/{}",
                gateway_base_url.trim_end_matches('/'),
                config.name
            ),
            client,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Authorization endpoint URL carrying the CSRF `state`.
    #[must_use]
    pub fn authorization_url(&self, state: &str) -> Url {
        let mut url = self.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("state", state);
            if !self.scopes.is_empty() {
                query.append_pair("scope", &self.scopes.join(" "));
            }
        }
        url
    }

    /// Exchange an authorization code for a provider access token.
    ///
    /// # Errors
    /// `Exchange` when the provider rejects the code, `InvalidAccessToken` when the
    /// returned token is unusable, `Transport` on network failure.
    pub async fn exchange_code(&self, code: &str) -> Result<String, ProviderError> {
        let span = info_span!("oauth.exchange", provider = %self.name);
        let response = self
            .client
            .post(self.token_url.clone())
            .header(ACCEPT, "application/json")
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .instrument(span)
            .await?;

        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Exchange(format!("unreadable token response: {err}")))?;

        if let Some(error) = body.error {
            let detail = body.error_description.unwrap_or_default();
            return Err(ProviderError::Exchange(format!("{error} {detail}").trim().to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Exchange(format!("token endpoint returned {status}")));
        }
        if body
            .token_type
            .as_deref()
            .is_some_and(|kind| !kind.eq_ignore_ascii_case("bearer"))
        {
            return Err(ProviderError::InvalidAccessToken);
        }
        if body.expires_in.is_some_and(|seconds| seconds <= 0) {
            return Err(ProviderError::InvalidAccessToken);
        }
        body.access_token
            .filter(|token| !token.is_empty())
            .ok_or(ProviderError::InvalidAccessToken)
    }

    /// Resolve the caller's identity at the provider's identity endpoint.
    ///
    /// # Errors
    /// `InvalidAccessToken` when the provider refuses the token, `Identity` when the
    /// response carries no subject, `Transport` on network failure.
    pub async fn fetch_identity(&self, access_token: &str) -> Result<ExternalIdentity, ProviderError> {
        let span = info_span!("oauth.userinfo", provider = %self.name);
        let response = self
            .client
            .get(self.userinfo_url.clone())
            .header(ACCEPT, "application/json")
            .bearer_auth(access_token)
            .send()
            .instrument(span)
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::InvalidAccessToken);
        }
        if !status.is_success() {
            return Err(ProviderError::Identity(format!(
                "identity endpoint returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Identity(format!("unreadable identity response: {err}")))?;
        self.identity_from_claims(&body)
    }

    fn identity_from_claims(&self, claims: &Value) -> Result<ExternalIdentity, ProviderError> {
        let subject = ["sub", "id", "user_id"]
            .iter()
            .find_map(|key| match claims.get(key) {
                Some(Value::String(value)) if !value.is_empty() => Some(value.clone()),
                Some(Value::Number(value)) => Some(value.to_string()),
                _ => None,
            })
            .ok_or_else(|| ProviderError::Identity("identity response has no subject".to_string()))?;

        let string_claim = |keys: &[&str]| {
            keys.iter().find_map(|key| {
                claims
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
        };

        // Absent means unverified.
        let email_verified = match claims.get("email_verified") {
            Some(Value::Bool(verified)) => *verified,
            Some(Value::String(verified)) => verified.eq_ignore_ascii_case("true"),
            _ => false,
        };

        Ok(ExternalIdentity {
            provider: self.name.clone(),
            subject,
            email: string_claim(&["email"]),
            email_verified,
            username: string_claim(&["preferred_username", "login", "username", "name"]),
        })
    }
}
