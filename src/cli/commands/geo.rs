use clap::{Arg, ArgMatches, Command};
use std::time::Duration;

use crate::client_info::geo::{DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL};

pub const ARG_GEO_LOOKUP_URL: &str = "geo-lookup-url";
pub const ARG_GEO_CACHE_TTL_SECONDS: &str = "geo-cache-ttl-seconds";
pub const ARG_GEO_CACHE_CAPACITY: &str = "geo-cache-capacity";

#[derive(Debug, Clone)]
pub struct Options {
    /// Geolocation is disabled when no lookup URL is configured.
    pub lookup_url: Option<String>,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        Self {
            lookup_url: matches
                .get_one::<String>(ARG_GEO_LOOKUP_URL)
                .map(|url| url.trim().trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            cache_ttl: matches
                .get_one::<u64>(ARG_GEO_CACHE_TTL_SECONDS)
                .map_or(DEFAULT_CACHE_TTL, |seconds| Duration::from_secs(*seconds)),
            cache_capacity: matches
                .get_one::<u64>(ARG_GEO_CACHE_CAPACITY)
                .copied()
                .unwrap_or(DEFAULT_CACHE_CAPACITY),
        }
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GEO_LOOKUP_URL)
                .long(ARG_GEO_LOOKUP_URL)
                .help("Base URL of the IP geolocation service ({url}/{ip})")
                .env("TOLLGATE_GEO_LOOKUP_URL"),
        )
        .arg(
            Arg::new(ARG_GEO_CACHE_TTL_SECONDS)
                .long(ARG_GEO_CACHE_TTL_SECONDS)
                .help("How long a geolocation answer is cached")
                .env("TOLLGATE_GEO_CACHE_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_GEO_CACHE_CAPACITY)
                .long(ARG_GEO_CACHE_CAPACITY)
                .help("Maximum number of cached geolocation entries")
                .env("TOLLGATE_GEO_CACHE_CAPACITY")
                .default_value("10000")
                .value_parser(clap::value_parser!(u64)),
        )
}
