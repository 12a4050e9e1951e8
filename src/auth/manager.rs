//! Registry that resolves a route's authentication config to an [`Authenticator`].
//!
//! Provider misconfiguration surfaces here, at registration or resolution time, never
//! while serving a request.

use reqwest::Client;
use std::{collections::HashMap, sync::Arc, time::Duration};

use super::{
    AuthMethod, Authenticator, BasicAuthenticator, IdentityServices, OAuthAuthenticator,
    basic::DEFAULT_FAILURE_DELAY,
    oauth::{flow::FlowStateStore, provider::OAuthProvider},
};
use crate::config::{ProviderConfig, RouteAuthentication};

#[derive(Debug, thiserror::Error)]
pub enum AuthConfigError {
    #[error("unknown authentication method: {0:?}")]
    UnknownMethod(String),
    #[error("authentication is enabled but no method is set")]
    MissingMethod,
    #[error("method oauth2 requires a provider")]
    MissingProvider,
    #[error("provider {0:?} is not configured")]
    UnknownProvider(String),
    #[error("provider {0:?} is registered twice")]
    DuplicateProvider(String),
    #[error("provider {name:?} is misconfigured: {reason}")]
    InvalidProvider { name: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct AuthSettings {
    pub gateway_base_url: String,
    pub session_ttl: time::Duration,
    pub basic_failure_delay: Duration,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            gateway_base_url: "http://localhost:8080".to_string(),
            session_ttl: time::Duration::hours(24),
            basic_failure_delay: DEFAULT_FAILURE_DELAY,
        }
    }
}

pub struct AuthManager {
    services: IdentityServices,
    settings: Arc<AuthSettings>,
    client: Client,
    flows: Arc<FlowStateStore>,
    basic: Arc<BasicAuthenticator>,
    providers: HashMap<String, Arc<OAuthAuthenticator>>,
}

impl AuthManager {
    #[must_use]
    pub fn new(services: IdentityServices, settings: AuthSettings, client: Client) -> Self {
        let basic = Arc::new(BasicAuthenticator::new(
            services.users.clone(),
            settings.basic_failure_delay,
        ));
        Self {
            services,
            settings: Arc::new(settings),
            client,
            flows: Arc::new(FlowStateStore::default()),
            basic,
            providers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    #[must_use]
    pub fn services(&self) -> &IdentityServices {
        &self.services
    }

    /// Register a delegated identity provider.
    ///
    /// # Errors
    /// `InvalidProvider` for missing credentials or malformed endpoints,
    /// `DuplicateProvider` when the name is taken.
    pub fn register_provider(&mut self, config: &ProviderConfig) -> Result<(), AuthConfigError> {
        if self.providers.contains_key(&config.name) {
            return Err(AuthConfigError::DuplicateProvider(config.name.clone()));
        }
        let provider =
            OAuthProvider::from_config(config, &self.settings.gateway_base_url, self.client.clone())
                .map_err(|reason| AuthConfigError::InvalidProvider {
                    name: config.name.clone(),
                    reason,
                })?;
        let authenticator = OAuthAuthenticator::new(
            provider,
            self.flows.clone(),
            self.services.clone(),
            self.settings.clone(),
        );
        self.providers
            .insert(config.name.clone(), Arc::new(authenticator));
        Ok(())
    }

    #[must_use]
    pub fn provider(&self, name: &str) -> Option<Arc<OAuthAuthenticator>> {
        self.providers.get(name).cloned()
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Resolve a method and optional provider to an authenticator.
    ///
    /// # Errors
    /// `MissingProvider` for oauth2 without a provider, `UnknownProvider` when the
    /// provider was never registered.
    pub fn get_authenticator(
        &self,
        method: AuthMethod,
        provider: Option<&str>,
    ) -> Result<Authenticator, AuthConfigError> {
        match method {
            AuthMethod::Basic => Ok(Authenticator::Basic(self.basic.clone())),
            AuthMethod::Any => Ok(Authenticator::Any),
            AuthMethod::OAuth2 => {
                let name = provider
                    .filter(|name| !name.is_empty())
                    .ok_or(AuthConfigError::MissingProvider)?;
                self.provider(name)
                    .map(Authenticator::OAuth2)
                    .ok_or_else(|| AuthConfigError::UnknownProvider(name.to_string()))
            }
        }
    }

    /// Resolve a route's `authentication` block; `None` when authentication is disabled.
    ///
    /// # Errors
    /// Any `AuthConfigError`, including `UnknownMethod` for an unrecognized method name.
    pub fn resolve(
        &self,
        authentication: &RouteAuthentication,
    ) -> Result<Option<Authenticator>, AuthConfigError> {
        if !authentication.enabled {
            return Ok(None);
        }
        let method: AuthMethod = authentication
            .method
            .as_deref()
            .ok_or(AuthConfigError::MissingMethod)?
            .parse()?;
        self.get_authenticator(method, authentication.provider.as_deref())
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::SessionStore,
        store::memory::{MemorySessionRepository, MemoryTokenRepository, MemoryUserRepository},
        token::TokenService,
    };
    use secrecy::SecretString;

    fn manager() -> AuthManager {
        let users = Arc::new(MemoryUserRepository::default());
        let services = IdentityServices {
            users: users.clone(),
            sessions: Arc::new(SessionStore::new(Arc::new(MemorySessionRepository::default()))),
            tokens: Arc::new(TokenService::new(
                Arc::new(MemoryTokenRepository::default()),
                users,
            )),
        };
        AuthManager::new(services, AuthSettings::default(), Client::new())
    }

    fn provider_config(name: &str, client_id: &str, secret: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            client_id: client_id.to_string(),
            client_secret: SecretString::from(secret.to_string()),
            authorize_url: "https://idp.example.com/authorize".to_string(),
            token_url: "https://idp.example.com/token".to_string(),
            userinfo_url: "https://idp.example.com/user".to_string(),
            scopes: Vec::new(),
        }
    }

    fn route(enabled: bool, method: Option<&str>, provider: Option<&str>) -> RouteAuthentication {
        RouteAuthentication {
            enabled,
            method: method.map(str::to_string),
            provider: provider.map(str::to_string),
        }
    }

    #[test]
    fn register_provider_requires_credentials() {
        let mut manager = manager();
        assert!(matches!(
            manager.register_provider(&provider_config("github", "", "secret")),
            Err(AuthConfigError::InvalidProvider { .. })
        ));
        assert!(matches!(
            manager.register_provider(&provider_config("github", "id", " ")),
            Err(AuthConfigError::InvalidProvider { .. })
        ));
        assert!(manager.provider("github").is_none());
    }

    #[test]
    fn register_provider_rejects_duplicates() -> anyhow::Result<()> {
        let mut manager = manager();
        manager.register_provider(&provider_config("github", "id", "secret"))?;
        assert!(matches!(
            manager.register_provider(&provider_config("github", "id", "secret")),
            Err(AuthConfigError::DuplicateProvider(_))
        ));
        Ok(())
    }

    #[test]
    fn resolves_each_method() -> anyhow::Result<()> {
        let mut manager = manager();
        manager.register_provider(&provider_config("github", "id", "secret"))?;

        assert_eq!(
            manager.get_authenticator(AuthMethod::Basic, None)?.method(),
            AuthMethod::Basic
        );
        assert_eq!(
            manager.get_authenticator(AuthMethod::Any, None)?.method(),
            AuthMethod::Any
        );
        assert_eq!(
            manager
                .get_authenticator(AuthMethod::OAuth2, Some("github"))?
                .method(),
            AuthMethod::OAuth2
        );
        Ok(())
    }

    #[test]
    fn resolution_errors_are_configuration_errors() {
        let manager = manager();
        assert!(matches!(
            manager.get_authenticator(AuthMethod::OAuth2, None),
            Err(AuthConfigError::MissingProvider)
        ));
        assert!(matches!(
            manager.get_authenticator(AuthMethod::OAuth2, Some("gitlab")),
            Err(AuthConfigError::UnknownProvider(name)) if name == "gitlab"
        ));
        assert!(matches!(
            manager.resolve(&route(true, Some("kerberos"), None)),
            Err(AuthConfigError::UnknownMethod(_))
        ));
        assert!(matches!(
            manager.resolve(&route(true, None, None)),
            Err(AuthConfigError::MissingMethod)
        ));
    }

    #[test]
    fn disabled_authentication_resolves_to_none() -> anyhow::Result<()> {
        let manager = manager();
        assert!(manager.resolve(&route(false, Some("kerberos"), None))?.is_none());
        Ok(())
    }
}
