//! Handshake authentication.
//!
//! Credential verification itself lives elsewhere; this service only consumes
//! a verifier that turns a bearer token into a tenant-scoped identity.

mod claims;
mod jwt;

pub use claims::{Claims, Identity};
pub use jwt::JwtValidator;

use crate::error::AppError;

/// Turns a presented credential into a verified identity.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AppError>;
}
