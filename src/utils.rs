//! Small helpers shared by the session, token and delegated-identity code.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// Draw `N` bytes from the OS CSPRNG and encode them URL-safe without padding.
pub(crate) fn generate_random_token<const N: usize>() -> Result<String> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to draw random bytes")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// One-way digest used for API token lookups; the plaintext never reaches storage.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Accept only local absolute paths as post-login or post-logout targets.
pub(crate) fn local_redirect_target(candidate: Option<&str>) -> String {
    candidate
        .map(str::trim)
        .filter(|target| {
            target.starts_with('/') && !target.starts_with("//") && !target.contains('\\')
        })
        .map_or_else(|| "/".to_string(), str::to_string)
}
