//! YAML-file-backed credential store.
//!
//! Entries carry SHA-256 digests, never plaintext secrets. `rtrelay keygen`
//! prints a ready-to-paste stanza. The file is loaded once at startup; a
//! missing or unreadable file at lookup time surfaces as
//! [`AuthError::Unavailable`] so the frontend can answer with a retriable
//! 5xx instead of rejecting the credential.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::{AuthError, CredentialStore, Credentials, Principal, Quotas};

#[derive(Debug, Clone, Deserialize)]
pub struct PrincipalEntry {
    pub id: String,
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub disabled: bool,
    /// Hex SHA-256 of the API key (bearer auth).
    pub api_key_sha256: Option<String>,
    /// Username + hex SHA-256 of the password (basic auth).
    pub username: Option<String>,
    pub password_sha256: Option<String>,
}

fn default_tier() -> String {
    "free".into()
}

fn default_region() -> String {
    "US".into()
}

#[derive(Debug, Deserialize)]
struct PrincipalsFile {
    principals: Vec<PrincipalEntry>,
}

pub struct FileStore {
    by_key_digest: HashMap<String, PrincipalEntry>,
    by_username: HashMap<String, PrincipalEntry>,
}

/// Lowercase hex SHA-256 digest of a secret.
pub fn sha256_hex(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn digest_eq(expected_hex: &str, presented: &str) -> bool {
    let presented_hex = sha256_hex(presented);
    // Both sides are fixed-length hex, so ct_eq over the bytes is sound.
    expected_hex
        .as_bytes()
        .ct_eq(presented_hex.as_bytes())
        .into()
}

impl FileStore {
    pub fn from_entries(entries: Vec<PrincipalEntry>) -> Self {
        let mut by_key_digest = HashMap::new();
        let mut by_username = HashMap::new();
        for entry in entries {
            if let Some(digest) = &entry.api_key_sha256 {
                by_key_digest.insert(digest.to_lowercase(), entry.clone());
            }
            if let Some(username) = &entry.username {
                by_username.insert(username.clone(), entry.clone());
            }
        }
        Self {
            by_key_digest,
            by_username,
        }
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read principals file {}: {}", path, e))?;
        let parsed: PrincipalsFile = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse principals file {}: {}", path, e))?;
        tracing::info!(
            path = path,
            count = parsed.principals.len(),
            "loaded principals file"
        );
        Ok(Self::from_entries(parsed.principals))
    }

    pub fn len(&self) -> usize {
        self.by_key_digest.len() + self.by_username.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_principal(entry: &PrincipalEntry) -> Result<Principal, AuthError> {
        if entry.disabled {
            // Disabled accounts look exactly like unknown credentials.
            return Err(AuthError::Unauthenticated);
        }
        Ok(Principal {
            id: entry.id.clone(),
            name: entry.name.clone(),
            tier: entry.tier.clone(),
            region: entry.region.clone(),
        })
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn authenticate(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        match credentials {
            Credentials::Bearer(token) => {
                let digest = sha256_hex(token);
                let entry = self
                    .by_key_digest
                    .get(&digest)
                    .ok_or(AuthError::Unauthenticated)?;
                Self::to_principal(entry)
            }
            Credentials::Login { username, password } => {
                let entry = self
                    .by_username
                    .get(username)
                    .ok_or(AuthError::Unauthenticated)?;
                let expected = entry
                    .password_sha256
                    .as_deref()
                    .ok_or(AuthError::Unauthenticated)?;
                if !digest_eq(&expected.to_lowercase(), password) {
                    return Err(AuthError::Unauthenticated);
                }
                Self::to_principal(entry)
            }
        }
    }

    async fn quota_for(&self, principal: &Principal) -> Result<Quotas, AuthError> {
        Ok(super::tier_quotas(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, key: &str) -> PrincipalEntry {
        PrincipalEntry {
            id: id.into(),
            name: id.into(),
            tier: "free".into(),
            region: "US".into(),
            disabled: false,
            api_key_sha256: Some(sha256_hex(key)),
            username: None,
            password_sha256: None,
        }
    }

    #[tokio::test]
    async fn test_bearer_auth_roundtrip() {
        let store = FileStore::from_entries(vec![entry("p1", "rt_secret")]);
        let p = store
            .authenticate(&Credentials::Bearer("rt_secret".into()))
            .await
            .unwrap();
        assert_eq!(p.id, "p1");
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let store = FileStore::from_entries(vec![entry("p1", "rt_secret")]);
        let err = store
            .authenticate(&Credentials::Bearer("rt_wrong".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_disabled_indistinguishable_from_unknown() {
        let mut disabled = entry("p1", "rt_secret");
        disabled.disabled = true;
        let store = FileStore::from_entries(vec![disabled]);
        let err = store
            .authenticate(&Credentials::Bearer("rt_secret".into()))
            .await
            .unwrap_err();
        // Same variant, no distinguishing payload.
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_login_auth() {
        let mut e = entry("p2", "rt_unused");
        e.username = Some("alice".into());
        e.password_sha256 = Some(sha256_hex("hunter2"));
        let store = FileStore::from_entries(vec![e]);

        let ok = store
            .authenticate(&Credentials::Login {
                username: "alice".into(),
                password: "hunter2".into(),
            })
            .await;
        assert!(ok.is_ok());

        let bad = store
            .authenticate(&Credentials::Login {
                username: "alice".into(),
                password: "hunter3".into(),
            })
            .await;
        assert!(bad.is_err());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
principals:
  - id: p1
    name: dev laptop
    tier: pro
    api_key_sha256: "deadbeef"
  - id: p2
    name: ci bot
    disabled: true
    api_key_sha256: "cafebabe"
"#;
        let parsed: PrincipalsFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(parsed.principals.len(), 2);
        assert_eq!(parsed.principals[0].tier, "pro");
        assert_eq!(parsed.principals[0].region, "US"); // default
        assert!(parsed.principals[1].disabled);
    }
}
