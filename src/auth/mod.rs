//! Credential store: authenticates incoming clients and resolves quotas.
//!
//! The store is an injected trait object so the relay core never depends on
//! a concrete backend; the shipped implementation is the YAML file store in
//! [`file`]. Tests substitute their own fakes.

pub mod file;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::tier::{self, TierLimits};

/// Credentials presented by a connecting client.
#[derive(Debug, Clone)]
pub enum Credentials {
    Bearer(String),
    Login { username: String, password: String },
}

impl Credentials {
    /// Parse an HTTP `Authorization` header value.
    ///
    /// Accepts `Bearer <token>` and `Basic <base64(user:pass)>`. Anything
    /// else yields `None`, which the frontend treats as unauthenticated.
    pub fn from_authorization(header: &str) -> Option<Self> {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            if token.is_empty() {
                return None;
            }
            return Some(Credentials::Bearer(token.to_string()));
        }
        if let Some(encoded) = header.strip_prefix("Basic ") {
            use base64::Engine as _;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .ok()?;
            let decoded = String::from_utf8(decoded).ok()?;
            let (username, password) = decoded.split_once(':')?;
            return Some(Credentials::Login {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        None
    }
}

/// An authenticated client identity.
///
/// Holds only what the router and accountant need; mutation is the store's
/// business. Referenced everywhere else by `id`.
#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: String,
    pub name: String,
    pub tier: String,
    /// Billing region code, used by the cost projection. Defaults to "US".
    pub region: String,
}

/// Per-tier quota limits for a principal.
pub type Quotas = TierLimits;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed, unknown, expired, or disabled credential. Deliberately
    /// carries no detail so callers cannot distinguish the cases.
    #[error("unauthenticated")]
    Unauthenticated,

    /// The backing store could not be reached. Retriable, and distinct from
    /// a rejected credential.
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Verify a credential and return the principal it belongs to.
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError>;

    /// Quota lookup for an authenticated principal.
    async fn quota_for(&self, principal: &Principal) -> Result<Quotas, AuthError>;
}

/// Default `quota_for` used by stores that carry no per-principal overrides:
/// resolve the principal's tier against the built-in tier table.
pub fn tier_quotas(principal: &Principal) -> Quotas {
    tier::tier(&principal.tier).limits
}
