//! `any`: accept whatever identity an earlier stage attached. Never starts a login.

use super::AuthRejection;
use crate::middleware::RequestContext;

/// # Errors
/// `Unauthorized` (no challenge) when no identity is present.
pub fn authenticate(context: &RequestContext) -> Result<(), AuthRejection> {
    if context.is_authenticated() {
        Ok(())
    } else {
        Err(AuthRejection::Unauthorized { challenge: None })
    }
}
