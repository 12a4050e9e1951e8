//! Map validated CLI arguments to the action to run.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_PORT, auth, gateway, geo};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if arguments are inconsistent or the config file is invalid.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .filter(|dsn| !dsn.trim().is_empty());

    Ok(Action::Server(Args {
        port,
        dsn,
        gateway: gateway::Options::parse(matches)?,
        auth: auth::Options::parse(matches)?,
        geo: geo::Options::parse(matches),
    }))
}
