//! Per-route stages: cache headers always, authentication when the route enables it.
//!
//! The table is keyed by the matched route pattern; routes without an entry get the
//! open chain (cache headers only).

use axum::{
    extract::{MatchedPath, Request, State},
    http::{
        HeaderValue, StatusCode,
        header::{CACHE_CONTROL, LOCATION},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use super::context::{put_context, take_context};
use crate::{
    auth::{AuthConfigError, AuthManager, AuthRejection, Authenticator},
    config::RouteConfig,
};

const DYNAMIC_CACHE_CONTROL: &str = "no-store";
const STATIC_CACHE_CONTROL: &str = "private, no-cache";

#[derive(Debug, thiserror::Error)]
pub enum RouteChainError {
    #[error("route {path}: {source}")]
    Auth {
        path: String,
        #[source]
        source: AuthConfigError,
    },
    #[error("route {path}: invalid cache_control value {value:?}")]
    InvalidCacheControl { path: String, value: String },
}

#[derive(Debug)]
struct RouteAuth {
    authenticator: Authenticator,
    static_content: bool,
    login_page: String,
}

impl RouteAuth {
    /// Static content is browsed, so a missing identity goes to the login page.
    fn reject(&self, rejection: AuthRejection, original_url: &str) -> Response {
        match rejection {
            AuthRejection::Unauthorized { .. } if self.static_content => {
                let target: String =
                    url::form_urlencoded::byte_serialize(original_url.as_bytes()).collect();
                let location = format!("{}?redirect={target}", self.login_page);
                match HeaderValue::from_str(&location) {
                    Ok(location) => (StatusCode::FOUND, [(LOCATION, location)]).into_response(),
                    Err(_) => StatusCode::UNAUTHORIZED.into_response(),
                }
            }
            other => other.into_response(),
        }
    }
}

#[derive(Debug)]
pub struct RouteChain {
    cache_control: HeaderValue,
    auth: Option<RouteAuth>,
}

impl RouteChain {
    /// Cache headers only.
    #[must_use]
    pub fn open() -> Self {
        Self {
            cache_control: HeaderValue::from_static(DYNAMIC_CACHE_CONTROL),
            auth: None,
        }
    }

    /// # Errors
    /// `RouteChainError` when the authentication block does not resolve or the cache
    /// header is not a valid header value.
    pub fn build(
        route: &RouteConfig,
        manager: &AuthManager,
        login_page: &str,
    ) -> Result<Self, RouteChainError> {
        let default_cache = if route.static_content {
            STATIC_CACHE_CONTROL
        } else {
            DYNAMIC_CACHE_CONTROL
        };
        let cache_value = route.cache_control.as_deref().unwrap_or(default_cache);
        let cache_control =
            HeaderValue::from_str(cache_value).map_err(|_| RouteChainError::InvalidCacheControl {
                path: route.path.clone(),
                value: cache_value.to_string(),
            })?;

        let auth = manager
            .resolve(&route.authentication)
            .map_err(|source| RouteChainError::Auth {
                path: route.path.clone(),
                source,
            })?
            .map(|authenticator| RouteAuth {
                authenticator,
                static_content: route.static_content,
                login_page: login_page.to_string(),
            });

        Ok(Self {
            cache_control,
            auth,
        })
    }

    #[must_use]
    pub fn requires_authentication(&self) -> bool {
        self.auth.is_some()
    }

    pub async fn run(&self, mut request: Request, next: Next) -> Response {
        let mut response = match &self.auth {
            None => next.run(request).await,
            Some(auth) => {
                let original_url = request
                    .uri()
                    .path_and_query()
                    .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
                let mut context = take_context(&mut request);
                let (parts, body) = request.into_parts();
                let outcome = auth.authenticator.authenticate(&parts, &mut context).await;
                let mut request = Request::from_parts(parts, body);
                match outcome {
                    Ok(()) => {
                        put_context(&mut request, context);
                        next.run(request).await
                    }
                    Err(rejection) => {
                        debug!(status = %rejection.status(), "route authentication rejected");
                        auth.reject(rejection, &original_url)
                    }
                }
            }
        };

        if !response.headers().contains_key(CACHE_CONTROL) {
            response
                .headers_mut()
                .insert(CACHE_CONTROL, self.cache_control.clone());
        }
        response
    }
}

#[derive(Debug)]
pub struct RouteChainTable {
    routes: HashMap<String, Arc<RouteChain>>,
    open: Arc<RouteChain>,
}

impl Default for RouteChainTable {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            open: Arc::new(RouteChain::open()),
        }
    }
}

impl RouteChainTable {
    /// Build chains for `routes`. Later entries for the same path replace earlier ones.
    ///
    /// # Errors
    /// The first `RouteChainError` encountered.
    pub fn build(
        routes: &[RouteConfig],
        manager: &AuthManager,
        login_page: &str,
    ) -> Result<Self, RouteChainError> {
        let mut table = Self::default();
        for route in routes {
            let chain = RouteChain::build(route, manager, login_page)?;
            table.routes.insert(route.path.clone(), Arc::new(chain));
        }
        Ok(table)
    }

    #[must_use]
    pub fn lookup(&self, matched_path: Option<&str>) -> Arc<RouteChain> {
        matched_path
            .and_then(|path| self.routes.get(path))
            .cloned()
            .unwrap_or_else(|| self.open.clone())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

/// Router layer that runs the chain for the matched route.
pub async fn route_stage(
    State(table): State<Arc<RouteChainTable>>,
    request: Request,
    next: Next,
) -> Response {
    let chain = table.lookup(
        request
            .extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str),
    );
    chain.run(request, next).await
}
