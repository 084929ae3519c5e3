//! Helpers for the opaque-JSON event protocol.
//!
//! Events are `serde_json::Value` end to end; the relay only ever looks at
//! `type`, `event_id`, `response_id`, and the payload fields it accounts.
//! Dispatch happens through the closed [`EventClass`] lookup table with a
//! pass-through fallthrough for everything unrecognized.

use std::collections::HashSet;

use serde_json::{json, Value};
use uuid::Uuid;

/// PCM16 at 24 kHz mono: 24000 samples × 2 bytes × 0.02 s per tick.
pub const PCM16_BYTES_PER_TICK: usize = 960;

/// Extract the `type` of an event, if present.
pub fn event_type(event: &Value) -> Option<&str> {
    event.get("type").and_then(|t| t.as_str())
}

/// Extract the `response_id` an event refers to, if any.
pub fn response_id(event: &Value) -> Option<&str> {
    event.get("response_id").and_then(|t| t.as_str())
}

/// Generate a fresh `evt_<6-hex>` event id.
pub fn new_event_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("evt_{}", &hex[..6])
}

/// Ensure the event carries an `event_id`, stamping one unique within the
/// connection if absent. Returns the id in effect. Client-supplied ids are
/// kept verbatim, duplicates included; deduplication is the client's
/// responsibility.
pub fn ensure_event_id(event: &mut Value, issued: &mut HashSet<String>) -> String {
    if let Some(id) = event.get("event_id").and_then(|v| v.as_str()) {
        return id.to_string();
    }
    let mut id = new_event_id();
    while !issued.insert(id.clone()) {
        id = new_event_id();
    }
    if let Some(obj) = event.as_object_mut() {
        obj.insert("event_id".into(), Value::String(id.clone()));
    }
    id
}

// ── Server-originated framing events ──────────────────────────

pub fn connection_established() -> Value {
    json!({
        "event_id": new_event_id(),
        "type": "connection.established",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

pub fn session_created(session_id: &Uuid) -> Value {
    json!({
        "event_id": new_event_id(),
        "type": "session.created",
        "session_id": session_id.to_string(),
    })
}

/// Synthetic `error` event in the upstream wire shape.
pub fn error_event(error_type: &str, code: &str, message: &str, param: Option<&str>) -> Value {
    json!({
        "event_id": new_event_id(),
        "type": "error",
        "error": {
            "type": error_type,
            "code": code,
            "message": message,
            "param": param,
        }
    })
}

/// `response.cancel` synthesized when barge-in interrupts an active response.
pub fn response_cancel(response_id: &str) -> Value {
    json!({
        "event_id": new_event_id(),
        "type": "response.cancel",
        "response_id": response_id,
    })
}

/// `function.response` synthesized after a local tool-registry call.
pub fn function_response(response_id: Option<&str>, result: Value) -> Value {
    json!({
        "event_id": new_event_id(),
        "type": "function.response",
        "response_id": response_id,
        "result": result,
    })
}

/// Late adjustment of non-fingerprint fields on a reused upstream session.
pub fn session_update(session: Value) -> Value {
    json!({
        "event_id": new_event_id(),
        "type": "session.update",
        "session": session,
    })
}

// ── Taxonomy ──────────────────────────────────────────────────

/// Event classes the router reacts to. Everything else passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    // client → upstream
    InitSession,
    AudioAppend,
    FunctionCall,
    ResponseCancel,
    // upstream → client
    SessionCreated,
    ResponseCreated,
    ResponseDone,
    TextDelta,
    AudioTranscriptDelta,
    AudioDelta,
    SpeechStarted,
    SpeechStopped,
    RateLimitsUpdated,
    Error,
    // both directions
    PassThrough,
}

pub fn classify(event_type: &str) -> EventClass {
    match event_type {
        "init_session" => EventClass::InitSession,
        "input_audio_buffer.append" => EventClass::AudioAppend,
        "function.call" => EventClass::FunctionCall,
        "response.cancel" => EventClass::ResponseCancel,
        "session.created" => EventClass::SessionCreated,
        "response.created" => EventClass::ResponseCreated,
        "response.done" => EventClass::ResponseDone,
        "response.text.delta" => EventClass::TextDelta,
        "response.audio_transcript.delta" => EventClass::AudioTranscriptDelta,
        "response.audio.delta" => EventClass::AudioDelta,
        "input_audio_buffer.speech_started" => EventClass::SpeechStarted,
        "input_audio_buffer.speech_stopped" => EventClass::SpeechStopped,
        "rate_limits.updated" => EventClass::RateLimitsUpdated,
        "error" => EventClass::Error,
        _ => EventClass::PassThrough,
    }
}

// ── Audio accounting ──────────────────────────────────────────

/// Decoded byte length of a base64 payload, computed from the encoded length
/// without decoding. Best-effort: malformed base64 still yields an estimate.
pub fn base64_decoded_len(b64: &str) -> usize {
    let padding = b64.len() - b64.trim_end_matches('=').len();
    let groups = b64.len() / 4 + usize::from(b64.len() % 4 > 0);
    (groups * 3).saturating_sub(padding)
}

/// Audio ticks (≈20 ms of PCM16 at 24 kHz) carried by a base64 payload,
/// rounded up so no nonzero frame counts as zero.
pub fn audio_ticks(b64_payload: &str) -> u64 {
    let bytes = base64_decoded_len(b64_payload);
    (bytes.div_ceil(PCM16_BYTES_PER_TICK)) as u64
}

// ── Upstream error classification ─────────────────────────────

/// Upstream error codes that terminate the connection. Everything else is
/// forwarded and the connection continues.
pub fn is_fatal_error_code(code: &str) -> bool {
    matches!(
        code,
        "invalid_api_key"
            | "auth_failed"
            | "invalid_session"
            | "session_expired"
            | "account_deactivated"
    )
}

pub fn error_code(event: &Value) -> Option<&str> {
    event
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_event_id_format() {
        let id = new_event_id();
        assert!(id.starts_with("evt_"));
        assert_eq!(id.len(), 4 + 6);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ensure_event_id_stamps_missing() {
        let mut issued = HashSet::new();
        let mut event = json!({"type": "response.create"});
        let id = ensure_event_id(&mut event, &mut issued);
        assert_eq!(event["event_id"].as_str().unwrap(), id);
        assert!(issued.contains(&id));
    }

    #[test]
    fn test_ensure_event_id_keeps_client_id() {
        let mut issued = HashSet::new();
        let mut event = json!({"type": "x", "event_id": "client_7"});
        let id = ensure_event_id(&mut event, &mut issued);
        assert_eq!(id, "client_7");
        // Client ids are not tracked; duplicates are the client's problem.
        assert!(issued.is_empty());
    }

    #[test]
    fn test_stamped_ids_unique_within_connection() {
        let mut issued = HashSet::new();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let mut event = json!({"type": "x"});
            let id = ensure_event_id(&mut event, &mut issued);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_error_event_shape() {
        let e = error_event("invalid_request_error", "invalid_json", "bad payload", None);
        assert_eq!(e["type"], "error");
        assert_eq!(e["error"]["code"], "invalid_json");
        assert_eq!(e["error"]["param"], Value::Null);
        assert!(e["event_id"].as_str().unwrap().starts_with("evt_"));
    }

    #[test]
    fn test_classify_table() {
        assert_eq!(classify("init_session"), EventClass::InitSession);
        assert_eq!(
            classify("input_audio_buffer.append"),
            EventClass::AudioAppend
        );
        assert_eq!(classify("response.created"), EventClass::ResponseCreated);
        assert_eq!(classify("response.done"), EventClass::ResponseDone);
        assert_eq!(classify("response.text.delta"), EventClass::TextDelta);
        assert_eq!(classify("response.audio.delta"), EventClass::AudioDelta);
        assert_eq!(
            classify("input_audio_buffer.speech_started"),
            EventClass::SpeechStarted
        );
        assert_eq!(classify("rate_limits.updated"), EventClass::RateLimitsUpdated);
        // Recognized-but-passthrough and unknown types take the same path.
        assert_eq!(classify("response.text.done"), EventClass::PassThrough);
        assert_eq!(classify("conversation.item.created"), EventClass::PassThrough);
        assert_eq!(classify("something.novel"), EventClass::PassThrough);
    }

    #[test]
    fn test_base64_decoded_len() {
        for raw in [&b"a"[..], b"ab", b"abc", b"abcd", &[0u8; 960], &[7u8; 1921]] {
            let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
            assert_eq!(base64_decoded_len(&encoded), raw.len());
        }
    }

    #[test]
    fn test_audio_ticks_rounding() {
        // 960 bytes = exactly one 20ms tick; 961 rounds up to two.
        let one_tick = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 960]);
        assert_eq!(audio_ticks(&one_tick), 1);

        let five_ticks = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 4800]);
        assert_eq!(audio_ticks(&five_ticks), 5);

        let partial = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 100]);
        assert_eq!(audio_ticks(&partial), 1);

        assert_eq!(audio_ticks(""), 0);
    }

    #[test]
    fn test_fatal_error_codes() {
        assert!(is_fatal_error_code("auth_failed"));
        assert!(is_fatal_error_code("invalid_api_key"));
        assert!(is_fatal_error_code("session_expired"));
        assert!(!is_fatal_error_code("rate_limit_exceeded"));
        assert!(!is_fatal_error_code("server_error"));
    }

    #[test]
    fn test_error_code_extraction() {
        let e = json!({"type": "error", "error": {"code": "auth_failed"}});
        assert_eq!(error_code(&e), Some("auth_failed"));
        assert_eq!(error_code(&json!({"type": "error"})), None);
    }
}
