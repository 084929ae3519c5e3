//! Subscription tier tables: quota limits, request rates, price multipliers.

use rust_decimal::Decimal;
use serde::Serialize;

/// Quota limits attached to a tier. These are the quotas the frontend and
/// accountant enforce; anything not listed here is unlimited.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TierLimits {
    pub daily_tokens: u64,
    pub monthly_tokens: u64,
    pub concurrent_sessions: u32,
    pub audio_minutes: u32,
}

#[derive(Debug, Clone)]
pub struct Tier {
    pub name: &'static str,
    pub limits: TierLimits,
    /// Per-tier rate-limit override (requests per minute). `None` uses the
    /// process-wide default bucket capacity.
    pub requests_per_min: Option<u32>,
    /// Pricing multiplier applied by the cost projection.
    /// standard 1.0, discounted 0.9, premium 1.2.
    pub price_multiplier: Decimal,
}

fn d(s: &str) -> Decimal {
    use std::str::FromStr;
    Decimal::from_str(s).unwrap()
}

/// Resolve a tier by name. Unknown names fall back to `free`.
pub fn tier(name: &str) -> Tier {
    match name {
        "trial" => Tier {
            name: "trial",
            limits: TierLimits {
                daily_tokens: 10_000,
                monthly_tokens: 100_000,
                concurrent_sessions: 1,
                audio_minutes: 10,
            },
            requests_per_min: Some(10),
            price_multiplier: d("1.0"),
        },
        "pro" => Tier {
            name: "pro",
            limits: TierLimits {
                daily_tokens: 200_000,
                monthly_tokens: 5_000_000,
                concurrent_sessions: 5,
                audio_minutes: 100,
            },
            requests_per_min: None,
            price_multiplier: d("0.9"),
        },
        "enterprise" => Tier {
            name: "enterprise",
            limits: TierLimits {
                daily_tokens: 1_000_000,
                monthly_tokens: 20_000_000,
                concurrent_sessions: 20,
                audio_minutes: 1_000,
            },
            requests_per_min: None,
            price_multiplier: d("1.2"),
        },
        // "free" and anything unrecognized
        _ => Tier {
            name: "free",
            limits: TierLimits {
                daily_tokens: 50_000,
                monthly_tokens: 1_000_000,
                concurrent_sessions: 1,
                audio_minutes: 0,
            },
            requests_per_min: None,
            price_multiplier: d("1.0"),
        },
    }
}
