//! Per-principal usage ledger.
//!
//! Additive in-memory counters, sharded by principal-id hash to keep hot
//! principals off a global lock. Snapshots are clones; no per-event history
//! is retained.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub const USAGE_SHARDS: usize = 16;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageCounter {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub audio_input_tokens: u64,
    pub audio_output_tokens: u64,
    pub cached_input_tokens: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Token usage reported by a `response.done` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub audio_input_tokens: u64,
    pub audio_output_tokens: u64,
}

impl ResponseUsage {
    /// Extract usage from a `response.done` event.
    ///
    /// The usage object normally lives under `response.usage`; some upstream
    /// variants put it at the top level, so both shapes are accepted.
    pub fn from_event(event: &Value) -> Option<Self> {
        let usage = event
            .get("response")
            .and_then(|r| r.get("usage"))
            .or_else(|| event.get("usage"))?;

        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        let detail = |obj: &str, name: &str| {
            usage
                .get(obj)
                .and_then(|d| d.get(name))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };

        Some(Self {
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
            total_tokens: field("total_tokens"),
            cached_tokens: detail("input_token_details", "cached_tokens"),
            audio_input_tokens: detail("input_token_details", "audio_tokens"),
            audio_output_tokens: detail("output_token_details", "audio_tokens"),
        })
    }
}

pub struct UsageLedger {
    shards: Vec<Mutex<HashMap<String, UsageCounter>>>,
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            shards: (0..USAGE_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, principal_id: &str) -> &Mutex<HashMap<String, UsageCounter>> {
        let mut hasher = DefaultHasher::new();
        principal_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % USAGE_SHARDS]
    }

    fn update<F: FnOnce(&mut UsageCounter)>(&self, principal_id: &str, f: F) {
        let mut shard = self.shard(principal_id).lock().unwrap();
        let counter = shard.entry(principal_id.to_string()).or_default();
        f(counter);
        counter.last_activity = Some(Utc::now());
    }

    /// Record the token usage of one completed response.
    pub fn record_response_usage(&self, principal_id: &str, usage: &ResponseUsage) {
        self.update(principal_id, |c| {
            c.input_tokens += usage.input_tokens;
            c.output_tokens += usage.output_tokens;
            c.cached_input_tokens += usage.cached_tokens;
            c.audio_input_tokens += usage.audio_input_tokens;
            c.audio_output_tokens += usage.audio_output_tokens;
            c.request_count += 1;
        });
    }

    /// Account inbound audio ticks counted off `input_audio_buffer.append`.
    pub fn record_audio_input(&self, principal_id: &str, ticks: u64) {
        if ticks == 0 {
            return;
        }
        self.update(principal_id, |c| c.audio_input_tokens += ticks);
    }

    /// Account outbound audio ticks counted off `response.audio.delta`.
    pub fn record_audio_output(&self, principal_id: &str, ticks: u64) {
        if ticks == 0 {
            return;
        }
        self.update(principal_id, |c| c.audio_output_tokens += ticks);
    }

    pub fn record_error(&self, principal_id: &str) {
        self.update(principal_id, |c| c.error_count += 1);
    }

    /// Snapshot one principal's counters.
    pub fn snapshot(&self, principal_id: &str) -> Option<UsageCounter> {
        self.shard(principal_id)
            .lock()
            .unwrap()
            .get(principal_id)
            .cloned()
    }

    /// Snapshot every principal (the /metrics payload).
    pub fn snapshot_all(&self) -> HashMap<String, UsageCounter> {
        let mut all = HashMap::new();
        for shard in &self.shards {
            for (id, counter) in shard.lock().unwrap().iter() {
                all.insert(id.clone(), counter.clone());
            }
        }
        all
    }
}
