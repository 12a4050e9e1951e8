use crate::{
    GIT_COMMIT_HASH,
    api::AppState,
    store::postgres,
};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    /// `ok`, `error`, or `disabled` when running on in-memory stores.
    database: String,
    geolocation: String,
    sessions_backend: String,
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Gateway and its database are healthy", body = [Health]),
        (status = 503, description = "Database is unreachable", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, state: Extension<Arc<AppState>>) -> impl IntoResponse {
    let database = match &state.pool {
        Some(pool) => match postgres::ping(pool).await {
            Ok(()) => "ok",
            Err(err) => {
                error!("Database health check failed: {err:#}");
                "error"
            }
        },
        None => "disabled",
    };

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: database.to_string(),
        geolocation: if state.client_info.geolocation_enabled() {
            "enabled".to_string()
        } else {
            "disabled".to_string()
        },
        sessions_backend: if state.pool.is_some() {
            "postgres".to_string()
        } else {
            "memory".to_string()
        },
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = health.commit.get(..7).unwrap_or_default();
    let mut headers = HeaderMap::new();
    match format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>() {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to parse X-App header: {}", err),
    }

    if database == "error" {
        debug!("Database connection is unhealthy");
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    } else {
        (StatusCode::OK, headers, body)
    }
}
