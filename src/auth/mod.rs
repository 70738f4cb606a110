//! Identity extraction -- A5, thin.
//!
//! The bearer-token format and the `POST /auth/google` OAuth exchange are
//! external boundaries: their internal logic is out of scope here.
//! This module only carries the *shape* the core needs at those
//! boundaries -- a verifier the wire layer calls at handshake time, and a
//! provider trait with no network implementation here.

mod jwt;

pub use jwt::{HmacTokenVerifier, VerifiedIdentity};

use crate::error::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Verifies the opaque bearer token presented as `?token=` at connection
/// establishment and extracts a user identity. The wire layer calls this
/// once per handshake; a failure closes the connection with status `1008`.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity>;
}

/// Exchanges an external OAuth authorization code for a local identity.
/// `POST /auth/google` is part of the external HTTP surface, not the core;
/// this trait exists only so the core's user-upsert contract is typed, not
/// to provide a network implementation.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange_code(&self, code: &str, redirect_uri: Option<&str>) -> Result<Uuid>;
}
