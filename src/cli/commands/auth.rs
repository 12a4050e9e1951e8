use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_TOKEN_SESSION_WINDOW_SECONDS: &str = "token-session-window-seconds";
pub const ARG_BASIC_AUTH_FAILURE_DELAY_MS: &str = "basic-auth-failure-delay-ms";
pub const ARG_ADMIN_USERNAME: &str = "admin-username";
pub const ARG_ADMIN_EMAIL: &str = "admin-email";
pub const ARG_ADMIN_PASSWORD: &str = "admin-password";

#[derive(Debug)]
pub struct AdminBootstrap {
    pub username: String,
    pub email: String,
    pub password: SecretString,
}

#[derive(Debug)]
pub struct Options {
    pub session_ttl_seconds: i64,
    pub token_session_window_seconds: i64,
    pub basic_auth_failure_delay_ms: u64,
    pub admin: Option<AdminBootstrap>,
}

impl Options {
    /// # Errors
    /// Returns an error for non-positive lifetimes or a partial admin bootstrap.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let positive = |id: &str| -> Result<i64> {
            match matches.get_one::<i64>(id).copied() {
                Some(value) if value > 0 => Ok(value),
                _ => anyhow::bail!("--{id} must be a positive number of seconds"),
            }
        };
        let non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let admin = match (non_empty(ARG_ADMIN_USERNAME), non_empty(ARG_ADMIN_PASSWORD)) {
            (Some(username), Some(password)) => Some(AdminBootstrap {
                email: non_empty(ARG_ADMIN_EMAIL).unwrap_or_default(),
                username,
                password: SecretString::from(password),
            }),
            (None, None) => None,
            _ => anyhow::bail!(
                "--{ARG_ADMIN_USERNAME} and --{ARG_ADMIN_PASSWORD} must be given together"
            ),
        };

        Ok(Self {
            session_ttl_seconds: positive(ARG_SESSION_TTL_SECONDS)?,
            token_session_window_seconds: positive(ARG_TOKEN_SESSION_WINDOW_SECONDS)?,
            basic_auth_failure_delay_ms: matches
                .get_one::<u64>(ARG_BASIC_AUTH_FAILURE_DELAY_MS)
                .copied()
                .unwrap_or(1000),
            admin,
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = command
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Session lifetime in seconds")
                .env("TOLLGATE_SESSION_TTL_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_TOKEN_SESSION_WINDOW_SECONDS)
                .long(ARG_TOKEN_SESSION_WINDOW_SECONDS)
                .help("Validity of the session view built for non-expiring API tokens")
                .env("TOLLGATE_TOKEN_SESSION_WINDOW_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_BASIC_AUTH_FAILURE_DELAY_MS)
                .long(ARG_BASIC_AUTH_FAILURE_DELAY_MS)
                .help("Fixed delay before answering a failed password check")
                .env("TOLLGATE_BASIC_AUTH_FAILURE_DELAY_MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        );
    with_admin_args(command)
}

fn with_admin_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ADMIN_USERNAME)
                .long(ARG_ADMIN_USERNAME)
                .help("Ensure an administrator with this username exists at startup")
                .env("TOLLGATE_ADMIN_USERNAME"),
        )
        .arg(
            Arg::new(ARG_ADMIN_EMAIL)
                .long(ARG_ADMIN_EMAIL)
                .help("Email of the bootstrap administrator")
                .env("TOLLGATE_ADMIN_EMAIL"),
        )
        .arg(
            Arg::new(ARG_ADMIN_PASSWORD)
                .long(ARG_ADMIN_PASSWORD)
                .help("Password of the bootstrap administrator")
                .env("TOLLGATE_ADMIN_PASSWORD")
                .hide_env_values(true),
        )
}
