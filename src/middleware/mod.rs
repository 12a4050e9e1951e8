//! Request pipeline composition.
//!
//! Global stages run on every request in declared order: fingerprint, identity,
//! traffic, logging. `Router::layer` makes the last added layer the outermost, so the
//! builder adds stages in reverse. Per-route stages live in [`route`].

pub mod context;
pub mod route;
pub mod traffic;

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::header::USER_AGENT,
    middleware::{Next, from_fn_with_state},
    response::Response,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, error, info_span};

pub use context::{RequestContext, put_context, take_context};
pub use route::{RouteChain, RouteChainTable, route_stage};
pub use traffic::{LogTrafficRecorder, TrafficRecord, TrafficRecorder};

use crate::{
    client_info::ClientInfoExtractor,
    config::GlobalChainConfig,
    session::{SessionStore, extract_bearer_token, extract_session_token},
    token::TokenService,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalStage {
    Fingerprint,
    Identity,
    Traffic,
    Logging,
}

/// Collaborators the global stages read from.
#[derive(Clone)]
pub struct ChainState {
    pub client_info: Arc<ClientInfoExtractor>,
    pub sessions: Arc<SessionStore>,
    pub tokens: Arc<TokenService>,
    pub traffic: Arc<dyn TrafficRecorder>,
}

#[derive(Clone, Debug, Default)]
pub struct MiddlewareChainBuilder {
    stages: Vec<GlobalStage>,
}

impl MiddlewareChainBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages enabled in `config`, in their fixed execution order.
    #[must_use]
    pub fn from_config(config: &GlobalChainConfig) -> Self {
        let mut builder = Self::new();
        for (enabled, stage) in [
            (config.fingerprint, GlobalStage::Fingerprint),
            (config.identity, GlobalStage::Identity),
            (config.traffic, GlobalStage::Traffic),
            (config.logging, GlobalStage::Logging),
        ] {
            if enabled {
                builder = builder.stage(stage);
            }
        }
        builder
    }

    #[must_use]
    pub fn stage(mut self, stage: GlobalStage) -> Self {
        self.stages.push(stage);
        self
    }

    #[must_use]
    pub fn stages(&self) -> &[GlobalStage] {
        &self.stages
    }

    /// Wrap `router` so the stages execute in declared order.
    pub fn apply(&self, router: Router, state: &ChainState) -> Router {
        self.stages
            .iter()
            .rev()
            .fold(router, |router, stage| match stage {
                GlobalStage::Fingerprint => {
                    router.layer(from_fn_with_state(state.clone(), fingerprint_stage))
                }
                GlobalStage::Identity => {
                    router.layer(from_fn_with_state(state.clone(), identity_stage))
                }
                GlobalStage::Traffic => {
                    router.layer(from_fn_with_state(state.clone(), traffic_stage))
                }
                GlobalStage::Logging => {
                    router.layer(TraceLayer::new_for_http().make_span_with(make_span))
                }
            })
    }
}

/// Derive the client fingerprint and create the request context.
pub async fn fingerprint_stage(
    State(state): State<ChainState>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let mut context = take_context(&mut request);
    context.request_id = request_id(&request);
    context.client_info = state.client_info.extract(request.headers(), peer).await;
    put_context(&mut request, context);
    next.run(request).await
}

/// Best-effort identification from the session cookie or a bearer API token.
///
/// Never rejects; routes that need an identity enforce it in their own chain.
pub async fn identity_stage(
    State(state): State<ChainState>,
    mut request: Request,
    next: Next,
) -> Response {
    let mut context = take_context(&mut request);

    if context.identity.is_none() && extract_session_token(request.headers()).is_some() {
        let ip_address = context.ip_address().map(str::to_string);
        match state
            .sessions
            .validate_session(request.headers(), ip_address.as_deref())
            .await
        {
            Ok(Some(session)) => context.attach_session(session),
            Ok(None) => debug!("session cookie did not validate"),
            Err(err) => error!("Failed to validate session: {err:#}"),
        }
    }

    if context.identity.is_none() && extract_bearer_token(request.headers()).is_some() {
        match state
            .sessions
            .validate_token_auth(request.headers(), &state.tokens)
            .await
        {
            Ok(Some(view)) => context.attach_session(view),
            Ok(None) => {}
            Err(err) => debug!("bearer credential not accepted here: {err}"),
        }
    }

    put_context(&mut request, context);
    next.run(request).await
}

/// Hand one record per request to the traffic recorder.
pub async fn traffic_stage(
    State(state): State<ChainState>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let context = request.extensions().get::<RequestContext>();
    let user_id = context
        .and_then(|context| context.identity.as_ref())
        .map(|identity| identity.user_id);
    let ip = context.and_then(|context| context.client_info.ip_address.clone());
    let request_id = request_id(&request);

    let response = next.run(request).await;

    state
        .traffic
        .record(TrafficRecord {
            method,
            path,
            status: response.status().as_u16(),
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            user_id,
            ip,
            user_agent,
            request_id,
        })
        .await;
    response
}

fn request_id(request: &Request) -> Option<String> {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
