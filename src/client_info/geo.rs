//! IP geolocation behind a bounded TTL cache.
//!
//! The lookup itself is an external collaborator (`GeoLookup`). `CachedGeoLookup`
//! bounds memory with both a time-to-live and a capacity cap, and never asks the
//! collaborator about private, loopback or link-local addresses.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};
use tracing::{Instrument, debug, info_span, warn};
use utoipa::ToSchema;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_CACHE_CAPACITY: u64 = 10_000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub isp: Option<String>,
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation>;
}

/// JSON lookup against `{base_url}/{ip}`.
#[derive(Debug, Clone)]
pub struct HttpGeoLookup {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeoResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    region_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    isp: Option<String>,
}

impl HttpGeoLookup {
    #[must_use]
    pub fn new(base_url: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoLocation> {
        let url = format!("{}/{ip}", self.base_url);
        let span = info_span!("geo.lookup", http.url = %url);
        let response = self
            .client
            .get(&url)
            .send()
            .instrument(span)
            .await
            .context("geolocation request failed")?
            .error_for_status()
            .context("geolocation endpoint returned an error status")?;
        let body: GeoResponse = response
            .json()
            .await
            .context("invalid geolocation response")?;

        if body.status.as_deref() == Some("fail") {
            return Err(anyhow!(
                "geolocation lookup failed: {}",
                body.message.unwrap_or_default()
            ));
        }

        Ok(GeoLocation {
            country: body.country,
            country_code: body.country_code,
            region: body.region_name,
            city: body.city,
            latitude: body.lat,
            longitude: body.lon,
            isp: body.isp,
        })
    }
}

pub struct CachedGeoLookup {
    inner: Arc<dyn GeoLookup>,
    cache: Cache<IpAddr, GeoLocation>,
}

impl CachedGeoLookup {
    #[must_use]
    pub fn new(inner: Arc<dyn GeoLookup>, ttl: Duration, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// Resolve a location, falling back to empty fields on failure.
    /// Failures are not cached so a later request can retry.
    pub async fn locate(&self, ip: IpAddr) -> GeoLocation {
        if !is_public(ip) {
            return GeoLocation::default();
        }
        if let Some(hit) = self.cache.get(&ip).await {
            return hit;
        }
        match self.inner.lookup(ip).await {
            Ok(location) => {
                debug!(%ip, "cached geolocation");
                self.cache.insert(ip, location.clone()).await;
                location
            }
            Err(err) => {
                warn!(%ip, "Geolocation lookup failed: {err:#}");
                GeoLocation::default()
            }
        }
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public(IpAddr::V4(mapped));
            }
            !(v6.is_loopback() || v6.is_unspecified() || is_unique_local(&v6) || is_link_local(&v6))
        }
    }
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
