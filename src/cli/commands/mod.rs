pub mod auth;
pub mod gateway;
pub mod geo;
pub mod logging;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_PORT: &str = "port";
pub const ARG_DSN: &str = "dsn";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("tollgate")
        .about("Gateway trust layer: authentication, sessions and API tokens")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new(ARG_PORT)
                .short('p')
                .long(ARG_PORT)
                .help("Port to listen on")
                .default_value("8080")
                .env("TOLLGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new(ARG_DSN)
                .short('d')
                .long(ARG_DSN)
                .help("PostgreSQL connection string")
                .long_help(
                    "PostgreSQL connection string. Without it users, sessions and tokens live in memory and are lost on restart.",
                )
                .env("TOLLGATE_DSN"),
        );

    let command = gateway::with_args(command);
    let command = auth::with_args(command);
    let command = geo::with_args(command);
    logging::with_args(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_VARS: [&str; 9] = [
        "TOLLGATE_PORT",
        "TOLLGATE_DSN",
        "TOLLGATE_LOG_LEVEL",
        "TOLLGATE_CONFIG",
        "TOLLGATE_GATEWAY_BASE_URL",
        "TOLLGATE_SESSION_TTL_SECONDS",
        "TOLLGATE_ADMIN_USERNAME",
        "TOLLGATE_ADMIN_PASSWORD",
        "TOLLGATE_GEO_LOOKUP_URL",
    ];

    fn with_clean_env<F: FnOnce()>(f: F) {
        temp_env::with_vars_unset(ENV_VARS, f);
    }

    #[test]
    fn test_new() {
        let command = new();
        assert_eq!(command.get_name(), "tollgate");
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn defaults_without_arguments() {
        with_clean_env(|| {
            let matches = new().get_matches_from(vec!["tollgate"]);
            assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(8080));
            assert_eq!(matches.get_one::<String>(ARG_DSN), None);
            assert_eq!(
                matches
                    .get_one::<String>(gateway::ARG_GATEWAY_BASE_URL)
                    .map(String::as_str),
                Some("http://localhost:8080")
            );
            assert_eq!(
                matches.get_one::<i64>(auth::ARG_SESSION_TTL_SECONDS).copied(),
                Some(86_400)
            );
            assert_eq!(
                matches.get_one::<u64>(geo::ARG_GEO_CACHE_TTL_SECONDS).copied(),
                Some(604_800)
            );
            assert_eq!(matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(), Some(0));
        });
    }

    #[test]
    fn environment_overrides_defaults() {
        temp_env::with_vars(
            [
                ("TOLLGATE_PORT", Some("9443")),
                ("TOLLGATE_DSN", Some("postgres://tollgate@localhost:5432/tollgate")),
                ("TOLLGATE_LOG_LEVEL", Some("debug")),
                ("TOLLGATE_SESSION_TTL_SECONDS", Some("3600")),
            ],
            || {
                let matches = new().get_matches_from(vec!["tollgate"]);
                assert_eq!(matches.get_one::<u16>(ARG_PORT).copied(), Some(9443));
                assert_eq!(
                    matches.get_one::<String>(ARG_DSN).map(String::as_str),
                    Some("postgres://tollgate@localhost:5432/tollgate")
                );
                assert_eq!(matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(), Some(3));
                assert_eq!(
                    matches.get_one::<i64>(auth::ARG_SESSION_TTL_SECONDS).copied(),
                    Some(3600)
                );
            },
        );
    }

    #[test]
    fn verbosity_flag_counts() {
        with_clean_env(|| {
            let matches = new().get_matches_from(vec!["tollgate", "-vvv"]);
            assert_eq!(matches.get_one::<u8>(logging::ARG_VERBOSITY).copied(), Some(3));
        });
    }

    #[test]
    fn unknown_arguments_fail() {
        let result = new().try_get_matches_from(vec!["tollgate", "--no-such-flag"]);
        assert_eq!(
            result.map_err(|e| e.kind()).err(),
            Some(clap::error::ErrorKind::UnknownArgument)
        );
    }
}
