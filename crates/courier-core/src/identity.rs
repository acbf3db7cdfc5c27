//! Identity verification seam.

use crate::message::Identity;
use thiserror::Error;

/// Reasons a presented credential is refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    Missing,

    #[error("Invalid credential: {0}")]
    Invalid(String),

    #[error("Credential expired")]
    Expired,
}

/// Turns a bearer credential into a stable identity.
pub trait Verifier: Send + Sync {
    /// Verify `token` and return the identity it names.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] if the credential is malformed, forged or expired.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Accepts any non-empty token as the identity itself. Test use only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustingVerifier;

impl Verifier for TrustingVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            Err(AuthError::Missing)
        } else {
            Ok(token.to_string())
        }
    }
}
