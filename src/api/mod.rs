//! Operator surfaces: /metrics and /health.
//!
//! Pull-model JSON only. /metrics reports the accountant's per-principal
//! counters plus a cost projection; /health reflects pool capacity, queue
//! depth, drop counters, and connection liveness.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::models::pricing::{self, DEFAULT_REALTIME_MODEL};
use crate::models::tier;
use crate::AppState;

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let usage = state.usage.snapshot_all();
    let mut principals = serde_json::Map::new();
    for (principal_id, counter) in usage {
        // The projection uses the default realtime model; per-model pricing
        // would need per-model counters, which the ledger deliberately
        // does not keep.
        let (tier_name, region) = state
            .connections
            .profile_for(&principal_id)
            .map(|p| (p.tier, p.region))
            .unwrap_or_else(|| ("free".to_string(), "US".to_string()));
        let cost = pricing::project_cost(
            &counter,
            DEFAULT_REALTIME_MODEL,
            &region,
            tier::tier(&tier_name).price_multiplier,
        );
        let mut entry = serde_json::to_value(&counter).unwrap_or_else(|_| json!({}));
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("projected_cost_usd".into(), json!(cost.to_string()));
        }
        principals.insert(principal_id, entry);
    }

    let pool = state.pool.stats();
    Json(json!({
        "principals": principals,
        "pool": pool,
        "connections": {
            "active": state.connections.count(),
        },
        "rate_limiter": {
            "tracked_principals": state.limiter.tracked_principals(),
        },
    }))
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let pool = state.pool.stats();
    let usage = state.usage.snapshot_all();
    let last_activity = usage
        .values()
        .filter_map(|c| c.last_activity)
        .max()
        .map(|t| t.to_rfc3339());

    Json(json!({
        "status": "ok",
        "pool": pool,
        "connections": {
            "active": state.connections.count(),
            "live": state.connections.snapshot(),
        },
        "last_activity": last_activity,
    }))
}
