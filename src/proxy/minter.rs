//! Ephemeral token minting.
//!
//! Exchanges the server-held long-lived key plus a (whitelisted) session
//! config for a short-lived upstream credential via the upstream `sessions`
//! endpoint. One shot: failures surface as `MintFailed` without retry.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::time::Duration;
use zeroize::Zeroize;

use crate::errors::RelayError;
use crate::models::session_config::SessionConfig;

/// A short-lived upstream credential. The secret is zeroized on drop and
/// never appears in logs; its lifetime is shorter than any single upstream
/// session, so reconnecting a pooled session past expiry simply fails and
/// the session is replaced.
pub struct EphemeralCredential {
    secret: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EphemeralCredential {
    pub fn new(secret: String, expires_at: Option<DateTime<Utc>>) -> Self {
        Self { secret, expires_at }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl Drop for EphemeralCredential {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for EphemeralCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCredential")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct TokenMinter {
    client: reqwest::Client,
    sessions_url: String,
    api_key: String,
}

impl TokenMinter {
    pub fn new(sessions_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            sessions_url,
            api_key,
        }
    }

    /// Mint an ephemeral credential for the given session config.
    ///
    /// The typed config is the whitelist, so the request body can never
    /// carry client-supplied fields outside it.
    pub async fn mint(&self, config: &SessionConfig) -> Result<EphemeralCredential, RelayError> {
        let resp = self
            .client
            .post(&self.sessions_url)
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "realtime=v1")
            .json(config)
            .send()
            .await
            .map_err(|e| RelayError::MintFailed(format!("request error: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            tracing::warn!(status = %status, "ephemeral token mint rejected");
            return Err(RelayError::MintFailed(format!(
                "upstream returned {}: {}",
                status, snippet
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| RelayError::MintFailed(format!("invalid response body: {}", e)))?;

        let secret = body
            .get("client_secret")
            .and_then(|cs| cs.get("value"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RelayError::MintFailed("response missing client_secret.value".into())
            })?
            .to_string();

        let expires_at = body
            .get("client_secret")
            .and_then(|cs| cs.get("expires_at"))
            .and_then(|v| v.as_i64())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        tracing::debug!(model = ?config.model, "minted ephemeral credential");
        Ok(EphemeralCredential::new(secret, expires_at))
    }
}
