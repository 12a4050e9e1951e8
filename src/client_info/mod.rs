//! Request fingerprinting: network, device and location of the caller.

pub mod geo;
pub mod user_agent;

use axum::http::{
    HeaderMap,
    header::{REFERER, USER_AGENT},
};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use utoipa::ToSchema;

pub use geo::{CachedGeoLookup, GeoLocation, GeoLookup, HttpGeoLookup};

const TLS_FINGERPRINT_HEADERS: [&str; 2] = ["x-tls-fingerprint", "x-ja3-fingerprint"];

/// Derived fingerprint of the caller, embedded in sessions and tokens for audit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub browser: Option<String>,
    pub browser_version: Option<String>,
    pub os: Option<String>,
    pub device: Option<String>,
    pub referrer: Option<String>,
    pub tls_fingerprint: Option<String>,
    pub location: GeoLocation,
}

#[derive(Default)]
pub struct ClientInfoExtractor {
    geo: Option<Arc<CachedGeoLookup>>,
}

impl ClientInfoExtractor {
    #[must_use]
    pub fn new(geo: Option<Arc<CachedGeoLookup>>) -> Self {
        Self { geo }
    }

    #[must_use]
    pub fn geolocation_enabled(&self) -> bool {
        self.geo.is_some()
    }

    /// Build the fingerprint from headers and the socket peer, then enrich it with location.
    pub async fn extract(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientInfo {
        let mut info = fingerprint(headers, peer);
        if let Some(geo) = &self.geo
            && let Some(ip) = info
                .ip_address
                .as_deref()
                .and_then(|raw| raw.parse::<IpAddr>().ok())
        {
            info.location = geo.locate(ip).await;
        }
        info
    }
}

/// Header-only part of the fingerprint; no I/O.
#[must_use]
pub fn fingerprint(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientInfo {
    let user_agent = header_str(headers, USER_AGENT.as_str());
    let parsed = user_agent.as_deref().map(user_agent::parse);

    ClientInfo {
        ip_address: extract_client_ip(headers).or_else(|| peer.map(|addr| addr.ip().to_string())),
        browser: parsed.as_ref().and_then(|ua| ua.browser.clone()),
        browser_version: parsed.as_ref().and_then(|ua| ua.browser_version.clone()),
        os: parsed.as_ref().and_then(|ua| ua.os.clone()),
        device: parsed.map(|ua| ua.device),
        user_agent,
        referrer: header_str(headers, REFERER.as_str()),
        tls_fingerprint: TLS_FINGERPRINT_HEADERS
            .iter()
            .find_map(|name| header_str(headers, name)),
        location: GeoLocation::default(),
    }
}

/// Extract a client IP from common proxy headers.
#[must_use]
pub fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if forwarded.is_some() {
        return forwarded.map(str::to_string);
    }
    header_str(headers, "x-real-ip")
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
