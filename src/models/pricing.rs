use rust_decimal::Decimal;
use std::str::FromStr;

use crate::middleware::usage::UsageCounter;

/// Model used for cost projection when a principal has no recorded model.
pub const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";

/// Per-1M-token price vector for a realtime model (USD).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_m: Decimal,
    pub output_per_m: Decimal,
    pub cached_input_per_m: Decimal,
    pub audio_input_per_m: Decimal,
    pub audio_output_per_m: Decimal,
}

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Price table for the realtime model family (USD per 1M tokens).
///
/// More-specific patterns must come before less-specific ones:
/// "gpt-4o-mini-realtime" must precede "gpt-4o-realtime" because `contains`
/// matches both. Unknown models price at zero.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let zero = Decimal::ZERO;

    match model {
        m if m.contains("gpt-4o-mini-realtime") => ModelPricing {
            input_per_m: d("0.60"),
            output_per_m: d("2.40"),
            cached_input_per_m: d("0.30"),
            audio_input_per_m: d("10.00"),
            audio_output_per_m: d("20.00"),
        },
        m if m.contains("gpt-4o-realtime") => ModelPricing {
            input_per_m: d("5.00"),
            output_per_m: d("20.00"),
            cached_input_per_m: d("2.50"),
            audio_input_per_m: d("40.00"),
            audio_output_per_m: d("80.00"),
        },
        _ => ModelPricing {
            input_per_m: zero,
            output_per_m: zero,
            cached_input_per_m: zero,
            audio_input_per_m: zero,
            audio_output_per_m: zero,
        },
    }
}

/// Regional pricing adjustment. Unknown regions use the default 1.0.
pub fn region_multiplier(region_code: &str) -> Decimal {
    match region_code {
        "US" => d("1.0"),
        "EU" => d("1.2"),
        "UK" => d("1.15"),
        "IN" => d("0.8"),
        "BR" => d("0.85"),
        _ => d("1.0"),
    }
}

/// Project the cost of a usage snapshot.
///
/// `Σ (count_k × price_k × region_multiplier) / 1e6 × tier_multiplier`,
/// rounded to 6 decimal places for micro-billing. Reads the snapshot only;
/// stored counters are never touched.
pub fn project_cost(
    counter: &UsageCounter,
    model: &str,
    region_code: &str,
    tier_multiplier: Decimal,
) -> Decimal {
    let pricing = pricing_for_model(model);
    let region = region_multiplier(region_code);
    let one_million = Decimal::from(1_000_000u64);

    let component = |count: u64, per_m: Decimal| -> Decimal {
        Decimal::from(count) * per_m * region / one_million
    };

    let total = component(counter.input_tokens, pricing.input_per_m)
        + component(counter.output_tokens, pricing.output_per_m)
        + component(counter.cached_input_tokens, pricing.cached_input_per_m)
        + component(counter.audio_input_tokens, pricing.audio_input_per_m)
        + component(counter.audio_output_tokens, pricing.audio_output_per_m);

    (total * tier_multiplier).round_dp(6)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(
        input: u64,
        output: u64,
        cached: u64,
        audio_in: u64,
        audio_out: u64,
    ) -> UsageCounter {
        UsageCounter {
            input_tokens: input,
            output_tokens: output,
            cached_input_tokens: cached,
            audio_input_tokens: audio_in,
            audio_output_tokens: audio_out,
            ..Default::default()
        }
    }

    // ── Pricing match-order tests ─────────────────────────────

    #[test]
    fn test_mini_realtime_not_overcharged() {
        // gpt-4o-mini-realtime must match its own rule, not gpt-4o-realtime's
        let p = pricing_for_model("gpt-4o-mini-realtime-preview-2024-12-17");
        assert_eq!(p.input_per_m, d("0.60"));
        assert_eq!(p.audio_output_per_m, d("20.00"));
    }

    #[test]
    fn test_full_realtime_pricing() {
        let p = pricing_for_model("gpt-4o-realtime-preview-2024-12-17");
        assert_eq!(p.input_per_m, d("5.00"));
        assert_eq!(p.output_per_m, d("20.00"));
        assert_eq!(p.cached_input_per_m, d("2.50"));
        assert_eq!(p.audio_input_per_m, d("40.00"));
        assert_eq!(p.audio_output_per_m, d("80.00"));
    }

    #[test]
    fn test_unknown_model_zero() {
        let p = pricing_for_model("my-fine-tune");
        assert_eq!(p.input_per_m, Decimal::ZERO);
        assert_eq!(p.output_per_m, Decimal::ZERO);
    }

    // ── Region multipliers ────────────────────────────────────

    #[test]
    fn test_region_multipliers() {
        assert_eq!(region_multiplier("US"), d("1.0"));
        assert_eq!(region_multiplier("EU"), d("1.2"));
        assert_eq!(region_multiplier("UK"), d("1.15"));
        assert_eq!(region_multiplier("IN"), d("0.8"));
        assert_eq!(region_multiplier("BR"), d("0.85"));
        assert_eq!(region_multiplier("ZZ"), d("1.0"));
    }

    // ── Cost projection ───────────────────────────────────────

    #[test]
    fn test_text_only_cost() {
        // 1M in + 1M out of gpt-4o-realtime at US/standard: 5 + 20 = 25
        let c = counter(1_000_000, 1_000_000, 0, 0, 0);
        let cost = project_cost(&c, "gpt-4o-realtime-preview", "US", d("1.0"));
        assert_eq!(cost, d("25.00"));
    }

    #[test]
    fn test_audio_cost_dominates() {
        // 1M audio-in + 1M audio-out: 40 + 80 = 120
        let c = counter(0, 0, 0, 1_000_000, 1_000_000);
        let cost = project_cost(&c, "gpt-4o-realtime-preview", "US", d("1.0"));
        assert_eq!(cost, d("120.00"));
    }

    #[test]
    fn test_region_premium_applied() {
        let c = counter(1_000_000, 0, 0, 0, 0);
        let cost = project_cost(&c, "gpt-4o-realtime-preview", "EU", d("1.0"));
        assert_eq!(cost, d("6.00")); // 5.00 × 1.2
    }

    #[test]
    fn test_tier_multiplier_applied() {
        let c = counter(1_000_000, 0, 0, 0, 0);
        let discounted = project_cost(&c, "gpt-4o-realtime-preview", "US", d("0.9"));
        assert_eq!(discounted, d("4.50"));
    }

    #[test]
    fn test_micro_billing_rounding() {
        // 3 input tokens of gpt-4o-realtime: 3 × 5 / 1e6 = 0.000015
        let c = counter(3, 0, 0, 0, 0);
        let cost = project_cost(&c, "gpt-4o-realtime-preview", "US", d("1.0"));
        assert_eq!(cost, d("0.000015"));
    }

    #[test]
    fn test_cached_tokens_priced_separately() {
        let c = counter(0, 0, 1_000_000, 0, 0);
        let cost = project_cost(&c, "gpt-4o-realtime-preview", "US", d("1.0"));
        assert_eq!(cost, d("2.50"));
    }

    #[test]
    fn test_projection_does_not_mutate() {
        let c = counter(100, 200, 0, 0, 0);
        let before = c.clone();
        let _ = project_cost(&c, DEFAULT_REALTIME_MODEL, "US", d("1.0"));
        assert_eq!(c.input_tokens, before.input_tokens);
        assert_eq!(c.output_tokens, before.output_tokens);
    }
}
