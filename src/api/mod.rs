//! HTTP surface of the gateway.
//!
//! Layering, outermost first: request id, global stages (fingerprint, identity,
//! traffic, logging), per-route stages (cache headers, authentication), handler.

use crate::{
    auth::{AuthManager, AuthSettings, IdentityServices},
    client_info::ClientInfoExtractor,
    config::{GatewayConfig, RouteAuthentication, RouteConfig},
    middleware::{
        ChainState, MiddlewareChainBuilder, REQUEST_ID_HEADER, RouteChainTable, TrafficRecorder,
        route::RouteChainError, route_stage,
    },
};
use anyhow::Result;
use axum::{
    Extension, Router,
    http::{HeaderName, HeaderValue},
    middleware::from_fn_with_state,
    routing::{any, options},
};
use sqlx::PgPool;
use std::{collections::HashSet, future::Future, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer};
use tracing::{debug, info};
use ulid::Ulid;
use utoipa_axum::router::OpenApiRouter;

pub(crate) mod handlers;
// OpenAPI router wiring and route registration live in openapi.rs.
mod openapi;

pub use openapi::openapi;

/// Routes served by the gateway itself that require a caller.
const PROTECTED_ROUTES: [&str; 7] = [
    "/auth/session",
    "/api/sessions",
    "/api/tokens",
    "/api/tokens/{id}",
    "/api/admin/users/{user_id}/tokens",
    "/api/admin/users/{user_id}/tokens/{id}",
    "/auth/check",
];

/// Public gateway routes; config entries for these paths only adjust their chain.
const PUBLIC_ROUTES: [&str; 5] = [
    "/health",
    "/auth/login",
    "/auth/login/{provider}",
    "/auth/callback/{provider}",
    "/auth/logout",
];

pub struct AppState {
    pub auth: Arc<AuthManager>,
    pub client_info: Arc<ClientInfoExtractor>,
    pub traffic: Arc<dyn TrafficRecorder>,
    /// `None` when running on in-memory stores.
    pub pool: Option<PgPool>,
}

impl AppState {
    #[must_use]
    pub fn services(&self) -> &IdentityServices {
        self.auth.services()
    }

    #[must_use]
    pub fn settings(&self) -> &AuthSettings {
        self.auth.settings()
    }
}

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Built-in route policies. Config routes with the same path replace them.
#[must_use]
pub fn default_routes() -> Vec<RouteConfig> {
    PROTECTED_ROUTES
        .iter()
        .map(|path| RouteConfig {
            path: (*path).to_string(),
            static_content: false,
            cache_control: None,
            authentication: RouteAuthentication {
                enabled: true,
                method: Some("any".to_string()),
                provider: None,
            },
        })
        .collect()
}

/// Assemble the full application.
///
/// Config routes the gateway does not serve itself get a check endpoint that answers
/// 204 with the resolved identity in `X-Auth-*` headers, for `auth_request` style
/// proxies.
///
/// # Errors
/// Returns `RouteChainError` when a route's authentication does not resolve.
pub fn app(state: Arc<AppState>, config: &GatewayConfig) -> Result<Router, RouteChainError> {
    let (mut router, _openapi) = router().split_for_parts();
    router = router.route("/health", options(handlers::health::health));

    let served: HashSet<&str> = PROTECTED_ROUTES
        .iter()
        .chain(PUBLIC_ROUTES.iter())
        .copied()
        .collect();
    for route in &config.routes {
        if !served.contains(route.path.as_str()) {
            debug!(path = %route.path, "serving check endpoint");
            router = router.route(&route.path, any(handlers::check::check));
        }
    }

    let mut routes = default_routes();
    routes.extend(config.routes.iter().cloned());
    let table = RouteChainTable::build(&routes, &state.auth, &config.login_page)?;
    let router = router.layer(from_fn_with_state(Arc::new(table), route_stage));

    let chain_state = ChainState {
        client_info: state.client_info.clone(),
        sessions: state.services().sessions.clone(),
        tokens: state.services().tokens.clone(),
        traffic: state.traffic.clone(),
    };
    let router = MiddlewareChainBuilder::from_config(&config.global).apply(router, &chain_state);

    Ok(router.layer(Extension(state)).layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static(REQUEST_ID_HEADER),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                REQUEST_ID_HEADER,
            ))),
    ))
}

/// Serve `app` until `shutdown` resolves.
///
/// # Errors
/// Return error if the listener cannot bind or the server fails.
pub async fn serve<F>(port: u16, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}
