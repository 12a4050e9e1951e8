//! Argon2id password hashing (PHC strings).

use anyhow::{Context, Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;

/// Verified in place of a missing hash so unknown users cost as much as known ones.
static DUMMY_HASH: Lazy<Option<String>> = Lazy::new(|| hash_password("tollgate-dummy").ok());

/// Hash a password into a PHC string.
///
/// # Errors
/// Returns an error if Argon2 rejects the input.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash password"))?
        .to_string();
    Ok(hash)
}

/// Constant-time check of `password` against a stored PHC string.
///
/// A malformed stored hash never verifies.
#[must_use]
pub fn verify_password(stored_hash: &str, password: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Hash on the blocking pool.
///
/// # Errors
/// Returns an error if Argon2 rejects the input or the task panics.
pub async fn spawn_hash(password: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .context("password hashing task failed")?
}

/// Verify on the blocking pool. A missing hash still runs one Argon2 round
/// against a dummy hash and never verifies.
pub async fn spawn_verify(stored_hash: Option<String>, password: String) -> bool {
    tokio::task::spawn_blocking(move || match stored_hash {
        Some(hash) => verify_password(&hash, &password),
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                let _ = verify_password(dummy, &password);
            }
            false
        }
    })
    .await
    .unwrap_or(false)
}
