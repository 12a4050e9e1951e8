//! # Tollgate (gateway trust layer)
//!
//! `tollgate` authenticates inbound gateway requests and decides, per route,
//! which identity is required before a handler runs.
//!
//! ## Credentials
//!
//! - **Password:** HTTP Basic on every request, or a password login that mints a session.
//! - **Delegated identity:** `OAuth2` authorization-code flow against a configured provider.
//!   The CSRF `state` is single use; the provider identity endpoint is always consulted.
//! - **API tokens:** `Authorization: Bearer tg_pat_...`. Only a SHA-256 digest is stored.
//!
//! ## Sessions
//!
//! A session is live while it is authenticated, not closed, and not past `valid_until`.
//! Expiry is discovered lazily on the first validation after the deadline and persisted
//! as a close; a closed session never comes back.
//!
//! ## Request pipeline
//!
//! Global stages run in declared order (fingerprint, identity, traffic, logging), then
//! the per-route stages (cache headers, authentication) run before the handler.

pub mod api;
pub mod auth;
pub mod cli;
pub mod client_info;
pub mod config;
pub mod error;
pub mod middleware;
pub mod session;
pub mod store;
pub mod token;
mod utils;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
