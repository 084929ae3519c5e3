//! Typed session configuration: the whitelist of fields a client may request
//! for its upstream session, and the fingerprint the pool keys reuse on.
//!
//! Deserialization silently drops any field not listed here, so the token
//! minter can never see unknown fields; the whitelist is enforced by the
//! type, not by a scrubbing pass.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// The only audio format the relay (and upstream) accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    #[serde(rename = "pcm16")]
    Pcm16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_padding_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silence_duration_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_response: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<AudioFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<AudioFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Integer or the string "inf"; kept opaque.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<Value>,
}

impl SessionConfig {
    /// Parse a client-supplied config, dropping unrecognized fields.
    /// Fails only when a recognized field has the wrong shape.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// The subset of the config that determines upstream-session identity.
    /// Instructions and temperature are deliberately absent: they can be
    /// adjusted on a reused session with a late `session.update`.
    pub fn fingerprint(&self) -> SessionFingerprint {
        let mut modalities = self.modalities.clone().unwrap_or_default();
        modalities.sort();
        modalities.dedup();
        SessionFingerprint {
            model: self.model.clone(),
            modalities,
            voice: self.voice.clone(),
            input_audio_format: self.input_audio_format,
            output_audio_format: self.output_audio_format,
            has_turn_detection: self.turn_detection.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionFingerprint {
    pub model: Option<String>,
    pub modalities: Vec<Modality>,
    pub voice: Option<String>,
    pub input_audio_format: Option<AudioFormat>,
    pub output_audio_format: Option<AudioFormat>,
    pub has_turn_detection: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_dropped() {
        let value = json!({
            "model": "gpt-4o-realtime-preview",
            "modalities": ["text"],
            "favorite_color": "purple",
            "max_tokens": 99
        });
        let cfg = SessionConfig::from_value(&value).unwrap();
        assert_eq!(cfg.model.as_deref(), Some("gpt-4o-realtime-preview"));
        // The unknown fields never survive a round-trip to the minter.
        let reserialized = serde_json::to_value(&cfg).unwrap();
        assert!(reserialized.get("favorite_color").is_none());
        assert!(reserialized.get("max_tokens").is_none());
    }

    #[test]
    fn test_none_fields_omitted_from_wire() {
        let cfg = SessionConfig {
            model: Some("m".into()),
            ..Default::default()
        };
        let v = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v, json!({"model": "m"}));
    }

    #[test]
    fn test_audio_format_vocabulary() {
        let ok = json!({"input_audio_format": "pcm16"});
        assert!(SessionConfig::from_value(&ok).is_ok());

        let bad = json!({"input_audio_format": "mp3"});
        assert!(SessionConfig::from_value(&bad).is_err());
    }

    #[test]
    fn test_turn_detection_nested_parse() {
        let value = json!({
            "turn_detection": {
                "type": "server_vad",
                "threshold": 0.5,
                "prefix_padding_ms": 300,
                "silence_duration_ms": 500,
                "create_response": true
            }
        });
        let cfg = SessionConfig::from_value(&value).unwrap();
        let td = cfg.turn_detection.unwrap();
        assert_eq!(td.kind.as_deref(), Some("server_vad"));
        assert_eq!(td.silence_duration_ms, Some(500));
    }

    #[test]
    fn test_fingerprint_ignores_instructions_and_temperature() {
        let base = json!({"model": "m", "modalities": ["audio", "text"], "voice": "alloy"});
        let a = SessionConfig::from_value(&base).unwrap();

        let mut b = a.clone();
        b.instructions = Some("be terse".into());
        b.temperature = Some(0.4);

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_modalities_order_insensitive() {
        let a = SessionConfig::from_value(&json!({"modalities": ["audio", "text"]})).unwrap();
        let b = SessionConfig::from_value(&json!({"modalities": ["text", "audio"]})).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_identity_fields() {
        let a = SessionConfig::from_value(&json!({"model": "m1", "voice": "alloy"})).unwrap();
        let b = SessionConfig::from_value(&json!({"model": "m2", "voice": "alloy"})).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());

        let c = SessionConfig::from_value(&json!({"model": "m1", "voice": "echo"})).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_turn_detection_presence_only() {
        let with_a = SessionConfig::from_value(
            &json!({"turn_detection": {"type": "server_vad", "threshold": 0.5}}),
        )
        .unwrap();
        let with_b = SessionConfig::from_value(
            &json!({"turn_detection": {"type": "server_vad", "threshold": 0.9}}),
        )
        .unwrap();
        let without = SessionConfig::from_value(&json!({})).unwrap();

        // Presence matters, the parameters inside do not.
        assert_eq!(with_a.fingerprint(), with_b.fingerprint());
        assert_ne!(with_a.fingerprint(), without.fingerprint());
    }

    #[test]
    fn test_max_response_output_tokens_accepts_inf() {
        let cfg =
            SessionConfig::from_value(&json!({"max_response_output_tokens": "inf"})).unwrap();
        assert_eq!(cfg.max_response_output_tokens, Some(json!("inf")));

        let cfg = SessionConfig::from_value(&json!({"max_response_output_tokens": 4096})).unwrap();
        assert_eq!(cfg.max_response_output_tokens, Some(json!(4096)));
    }
}
