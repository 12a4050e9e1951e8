use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

use crate::config::GatewayConfig;

pub const ARG_GATEWAY_BASE_URL: &str = "gateway-base-url";
pub const ARG_CONFIG: &str = "config";

#[derive(Debug)]
pub struct Options {
    pub gateway_base_url: String,
    /// Route table, providers and global stage switches; defaults when absent.
    pub config: GatewayConfig,
    pub config_path: Option<PathBuf>,
}

impl Options {
    /// # Errors
    /// Returns an error if the base URL is not an absolute http(s) URL or the config
    /// file cannot be loaded.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let gateway_base_url = matches
            .get_one::<String>(ARG_GATEWAY_BASE_URL)
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or_default();
        let parsed = url::Url::parse(&gateway_base_url)
            .with_context(|| format!("invalid --{ARG_GATEWAY_BASE_URL}: {gateway_base_url:?}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("--{ARG_GATEWAY_BASE_URL} must be an http(s) URL");
        }

        let config_path = matches
            .get_one::<String>(ARG_CONFIG)
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        let config = match &config_path {
            Some(path) => GatewayConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => GatewayConfig::default(),
        };

        Ok(Self {
            gateway_base_url,
            config,
            config_path,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_GATEWAY_BASE_URL)
                .long(ARG_GATEWAY_BASE_URL)
                .help("Public base URL of the gateway")
                .long_help(
                    "Public base URL of the gateway. Used to build provider callback URLs \
                     ({base}/auth/callback/{provider}); an https URL marks cookies Secure.",
                )
                .env("TOLLGATE_GATEWAY_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_CONFIG)
                .short('c')
                .long(ARG_CONFIG)
                .help("JSON file with global stages, identity providers and route security")
                .env("TOLLGATE_CONFIG"),
        )
}
