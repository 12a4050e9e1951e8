//! Gateway configuration file (JSON).
//!
//! ```json
//! {
//!   "global": { "fingerprint": true, "identity": true, "traffic": true, "logging": true },
//!   "login_page": "/login",
//!   "providers": [{
//!     "name": "github",
//!     "client_id": "...",
//!     "client_secret": "...",
//!     "authorize_url": "https://github.com/login/oauth/authorize",
//!     "token_url": "https://github.com/login/oauth/access_token",
//!     "userinfo_url": "https://api.github.com/user",
//!     "scopes": ["read:user", "user:email"]
//!   }],
//!   "routes": [{
//!     "path": "/check/github",
//!     "static_content": false,
//!     "authentication": { "enabled": true, "method": "oauth2", "provider": "github" }
//!   }]
//! }
//! ```

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::{collections::HashSet, path::Path};

pub const DEFAULT_LOGIN_PAGE: &str = "/login";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid provider name: {0:?}")]
    InvalidProviderName(String),
    #[error("duplicate provider: {0}")]
    DuplicateProvider(String),
    #[error("route path must start with '/' and use {{param}} segments: {0:?}")]
    InvalidRoutePath(String),
    #[error("duplicate route: {0}")]
    DuplicateRoute(String),
    #[error("login page must be a local path: {0:?}")]
    InvalidLoginPage(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub global: GlobalChainConfig,
    #[serde(default = "default_login_page")]
    pub login_page: String,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            global: GlobalChainConfig::default(),
            login_page: default_login_page(),
            providers: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// Which global stages are installed. Order is fixed; only presence is configurable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalChainConfig {
    #[serde(default = "enabled")]
    pub fingerprint: bool,
    #[serde(default = "enabled")]
    pub identity: bool,
    #[serde(default = "enabled")]
    pub traffic: bool,
    #[serde(default = "enabled")]
    pub logging: bool,
}

impl Default for GlobalChainConfig {
    fn default() -> Self {
        Self {
            fingerprint: true,
            identity: true,
            traffic: true,
            logging: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    pub client_id: String,
    #[serde(deserialize_with = "secret_string")]
    pub client_secret: SecretString,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default)]
    pub static_content: bool,
    #[serde(default)]
    pub cache_control: Option<String>,
    #[serde(default)]
    pub authentication: RouteAuthentication,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteAuthentication {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl GatewayConfig {
    /// Read and validate a JSON config file.
    ///
    /// # Errors
    /// Returns `ConfigError` when the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// # Errors
    /// Returns `ConfigError` when the document is malformed or fails validation.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.login_page.starts_with('/') || self.login_page.starts_with("//") {
            return Err(ConfigError::InvalidLoginPage(self.login_page.clone()));
        }

        let mut providers = HashSet::new();
        for provider in &self.providers {
            let valid = !provider.name.is_empty()
                && provider
                    .name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
            if !valid {
                return Err(ConfigError::InvalidProviderName(provider.name.clone()));
            }
            if !providers.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
        }

        let mut routes = HashSet::new();
        for route in &self.routes {
            let legacy_segment = route
                .path
                .split('/')
                .any(|segment| segment.starts_with(':') || segment.starts_with('*'));
            if !route.path.starts_with('/') || legacy_segment {
                return Err(ConfigError::InvalidRoutePath(route.path.clone()));
            }
            if !routes.insert(route.path.as_str()) {
                return Err(ConfigError::DuplicateRoute(route.path.clone()));
            }
        }
        Ok(())
    }
}

fn default_login_page() -> String {
    DEFAULT_LOGIN_PAGE.to_string()
}

const fn enabled() -> bool {
    true
}

fn secret_string<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}
