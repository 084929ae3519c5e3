//! Relay frontend: accepts client WebSockets and owns connection lifecycle.
//!
//! Route: GET /ws
//!
//! Per connection:
//!   1. Authenticate the upgrade request's Authorization header
//!   2. Enforce the tier's concurrent-session quota
//!   3. Send `connection.established`
//!   4. Await `init_session` (5 s), parse the whitelisted session config
//!   5. Acquire an upstream session from the pool (minting as needed)
//!   6. Hand both sockets to the router; await either pump finishing
//!   7. Release the upstream session and drop the registry entry, on
//!      every exit path

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::{AuthError, Credentials, Principal};
use crate::errors::{close_code, RelayError};
use crate::models::event;
use crate::models::session_config::SessionConfig;
use crate::models::tier;
use crate::proxy::router::{self, RouterContext};
use crate::proxy::state::ConnectionState;
use crate::AppState;

pub const INIT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Live-connection registry ──────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub principal_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Tier/region of a principal as last seen at connect time. Retained after
/// disconnect so /metrics can price a principal's accumulated usage.
#[derive(Debug, Clone)]
pub struct PrincipalProfile {
    pub tier: String,
    pub region: String,
}

/// Accepted connections, keyed by connection id. Backs the concurrency
/// quota and the /health and /metrics surfaces.
#[derive(Default)]
pub struct ConnectionRegistry {
    live: DashMap<Uuid, ConnectionInfo>,
    profiles: DashMap<String, PrincipalProfile>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: Uuid, principal: &Principal) {
        self.live.insert(
            connection_id,
            ConnectionInfo {
                principal_id: principal.id.clone(),
                accepted_at: Utc::now(),
            },
        );
        self.profiles.insert(
            principal.id.clone(),
            PrincipalProfile {
                tier: principal.tier.clone(),
                region: principal.region.clone(),
            },
        );
    }

    pub fn unregister(&self, connection_id: &Uuid) {
        self.live.remove(connection_id);
    }

    pub fn count(&self) -> usize {
        self.live.len()
    }

    pub fn count_for(&self, principal_id: &str) -> usize {
        self.live
            .iter()
            .filter(|entry| entry.value().principal_id == principal_id)
            .count()
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.live.iter().map(|e| e.value().clone()).collect()
    }

    pub fn profile_for(&self, principal_id: &str) -> Option<PrincipalProfile> {
        self.profiles.get(principal_id).map(|p| p.value().clone())
    }
}

// ── Handler ───────────────────────────────────────────────────

/// GET /ws
///
/// Authentication happens before the upgrade so a broken store can answer
/// with a retriable 503. A rejected credential still upgrades and then
/// closes with 4401, so WebSocket clients observe the close code.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let credentials = headers
        .get("authorization")
        .or_else(|| headers.get("Authorization"))
        .and_then(|v| v.to_str().ok())
        .and_then(Credentials::from_authorization);

    let auth = match credentials {
        None => Err(RelayError::Unauthenticated),
        Some(credentials) => match state.auth.authenticate(&credentials).await {
            Ok(principal) => Ok(principal),
            Err(AuthError::Unauthenticated) => Err(RelayError::Unauthenticated),
            Err(AuthError::Unavailable(reason)) => {
                tracing::error!("credential store unavailable: {}", reason);
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
        },
    };

    Ok(ws
        .on_upgrade(move |socket| handle_socket(state, socket, auth))
        .into_response())
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Parse the first client frame: must be `init_session`, and its
/// `session_config` must fit the whitelist.
fn parse_init(raw: &str) -> Result<SessionConfig, RelayError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| RelayError::InvalidInit(format!("first frame is not JSON: {}", e)))?;
    match event::event_type(&value) {
        Some("init_session") => {}
        Some(other) => {
            return Err(RelayError::InvalidInit(format!(
                "first event must be init_session, got {}",
                other
            )))
        }
        None => return Err(RelayError::InvalidInit("first event has no type".into())),
    }
    let config_value = value.get("session_config").cloned().unwrap_or(Value::Null);
    if config_value.is_null() {
        return Ok(SessionConfig::default());
    }
    SessionConfig::from_value(&config_value)
        .map_err(|e| RelayError::InvalidInit(format!("bad session_config: {}", e)))
}

async fn handle_socket(
    state: Arc<AppState>,
    mut socket: WebSocket,
    auth: Result<Principal, RelayError>,
) {
    let principal = match auth {
        Ok(principal) => principal,
        Err(e) => {
            close_with(&mut socket, e.close_code(), e.close_reason()).await;
            return;
        }
    };

    let quotas = match state.auth.quota_for(&principal).await {
        Ok(quotas) => quotas,
        Err(e) => {
            tracing::error!(principal = %principal.id, "quota lookup failed: {}", e);
            close_with(&mut socket, close_code::RELAY_INTERNAL, "relay_internal").await;
            return;
        }
    };
    if state.connections.count_for(&principal.id) >= quotas.concurrent_sessions as usize {
        tracing::warn!(
            principal = %principal.id,
            limit = quotas.concurrent_sessions,
            "concurrent session quota exhausted"
        );
        close_with(&mut socket, close_code::RATE_LIMITED, "quota_exceeded").await;
        return;
    }

    // Claim the quota slot before any await point so a burst of connections
    // cannot all pass the check above.
    let connection_id = Uuid::new_v4();
    state.connections.register(connection_id, &principal);

    if socket
        .send(Message::Text(event::connection_established().to_string()))
        .await
        .is_err()
    {
        state.connections.unregister(&connection_id);
        return;
    }

    // First frame: init_session, within the init window.
    let first_frame = match tokio::time::timeout(INIT_TIMEOUT, socket.recv()).await {
        Err(_) => {
            close_with(&mut socket, close_code::INIT_TIMEOUT, "init_timeout").await;
            state.connections.unregister(&connection_id);
            return;
        }
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            close_with(&mut socket, close_code::INIT_TIMEOUT, "invalid_init").await;
            state.connections.unregister(&connection_id);
            return;
        }
    };

    let session_config = match parse_init(&first_frame) {
        Ok(config) => config,
        Err(e) => {
            let notice = event::error_event(
                "invalid_request_error",
                "invalid_init",
                &e.to_string(),
                Some("type"),
            );
            let _ = socket.send(Message::Text(notice.to_string())).await;
            close_with(&mut socket, e.close_code(), e.close_reason()).await;
            state.connections.unregister(&connection_id);
            return;
        }
    };

    let acquired = match state.pool.acquire(&session_config).await {
        Ok(acquired) => acquired,
        Err(e) => {
            tracing::warn!(principal = %principal.id, "upstream session setup failed: {}", e);
            let notice =
                event::error_event("relay_error", "relay_init_failed", &e.to_string(), None);
            let _ = socket.send(Message::Text(notice.to_string())).await;
            close_with(&mut socket, e.close_code(), e.close_reason()).await;
            state.connections.unregister(&connection_id);
            return;
        }
    };

    if socket
        .send(Message::Text(
            event::session_created(&acquired.session.id()).to_string(),
        ))
        .await
        .is_err()
    {
        state.pool.release(acquired.session);
        state.connections.unregister(&connection_id);
        return;
    }

    // A reused session keeps its fingerprint but may need the
    // non-fingerprint fields adjusted for this client.
    if acquired.reused {
        let mut fields = serde_json::Map::new();
        if let Some(instructions) = &session_config.instructions {
            fields.insert("instructions".into(), Value::String(instructions.clone()));
        }
        if let Some(temperature) = session_config.temperature {
            if let Some(number) = serde_json::Number::from_f64(temperature) {
                fields.insert("temperature".into(), Value::Number(number));
            }
        }
        if !fields.is_empty() {
            let _ = acquired
                .session
                .send(event::session_update(Value::Object(fields)));
        }
    }

    tracing::info!(
        connection_id = %connection_id,
        principal = %principal.id,
        session_id = %acquired.session.id(),
        reused = acquired.reused,
        "client connected"
    );

    let mut connection_state = ConnectionState::new();
    connection_state.initialized = true;

    let ctx = RouterContext {
        connection_id,
        principal: principal.clone(),
        state: Arc::new(Mutex::new(connection_state)),
        usage: state.usage.clone(),
        limiter: state.limiter.clone(),
        rate_capacity_override: tier::tier(&principal.tier).requests_per_min,
        tools: state.tools.clone(),
    };

    router::run(
        ctx,
        socket,
        acquired.session.clone(),
        Duration::from_secs(state.config.idle_timeout_secs),
    )
    .await;

    state.pool.release(acquired.session);
    state.connections.unregister(&connection_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn principal(id: &str) -> Principal {
        Principal {
            id: id.into(),
            name: id.into(),
            tier: "free".into(),
            region: "US".into(),
        }
    }

    #[test]
    fn test_registry_counts_per_principal() {
        let registry = ConnectionRegistry::new();
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();
        let c3 = Uuid::new_v4();
        registry.register(c1, &principal("p1"));
        registry.register(c2, &principal("p1"));
        registry.register(c3, &principal("p2"));

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.count_for("p1"), 2);
        assert_eq!(registry.count_for("p2"), 1);

        registry.unregister(&c1);
        assert_eq!(registry.count_for("p1"), 1);
    }

    #[test]
    fn test_parse_init_happy_path() {
        let raw = json!({
            "type": "init_session",
            "session_config": {"model": "m", "modalities": ["text"]}
        })
        .to_string();
        let config = parse_init(&raw).unwrap();
        assert_eq!(config.model.as_deref(), Some("m"));
    }

    #[test]
    fn test_parse_init_missing_config_defaults() {
        let raw = json!({"type": "init_session"}).to_string();
        let config = parse_init(&raw).unwrap();
        assert!(config.model.is_none());
    }

    #[test]
    fn test_parse_init_wrong_type() {
        let raw = json!({"type": "response.create"}).to_string();
        let err = parse_init(&raw).unwrap_err();
        assert!(matches!(err, RelayError::InvalidInit(_)));
        assert_eq!(err.close_code(), close_code::INIT_TIMEOUT);
    }

    #[test]
    fn test_parse_init_not_json() {
        assert!(matches!(
            parse_init("hello"),
            Err(RelayError::InvalidInit(_))
        ));
    }

    #[test]
    fn test_parse_init_bad_config_shape() {
        let raw = json!({
            "type": "init_session",
            "session_config": {"input_audio_format": "mp3"}
        })
        .to_string();
        assert!(matches!(
            parse_init(&raw),
            Err(RelayError::InvalidInit(_))
        ));
    }
}
