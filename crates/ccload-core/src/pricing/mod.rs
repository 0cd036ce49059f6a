//! Per-request cost computation against the static price table.
//!
//! Lookup order: alias table, base table, then prefix fuzzy-match with the
//! most specific (longest) prefixes first, so `gpt-5.1-codex-mini` wins over
//! `gpt-5.1-codex` which wins over `gpt-5`. Unknown models cost 0.

mod table;

use std::sync::OnceLock;

use tracing::error;

use table::{ALIASES, PRICES, PriceEntry};

const MILLION: f64 = 1_000_000.0;
const DEFAULT_TIER_THRESHOLD: i64 = 200_000;
const QWEN_PLUS_TIER_THRESHOLD: i64 = 256_000;

const CACHE_WRITE_5M_MULTIPLIER: f64 = 1.25;
const CACHE_WRITE_1H_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBreakdown {
    pub input_usd: f64,
    pub output_usd: f64,
    pub cache_read_usd: f64,
    pub cache_write_usd: f64,
    pub total_usd: f64,
}

/// Total request cost in USD. `input_tokens` is billable input, already net
/// of cached tokens (the SSE parser performs that normalization for OpenAI
/// shapes).
pub fn calculate_cost(
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    cache_read_tokens: i64,
    cache_5m_write_tokens: i64,
    cache_1h_write_tokens: i64,
) -> f64 {
    calculate_cost_detailed(
        model,
        input_tokens,
        output_tokens,
        cache_read_tokens,
        cache_5m_write_tokens,
        cache_1h_write_tokens,
    )
    .total_usd
}

pub fn calculate_cost_detailed(
    model: &str,
    input_tokens: i64,
    output_tokens: i64,
    cache_read_tokens: i64,
    cache_5m_write_tokens: i64,
    cache_1h_write_tokens: i64,
) -> CostBreakdown {
    let counts = [
        input_tokens,
        output_tokens,
        cache_read_tokens,
        cache_5m_write_tokens,
        cache_1h_write_tokens,
    ];
    if counts.iter().any(|count| *count < 0) {
        error!(
            model = %model,
            input_tokens,
            output_tokens,
            cache_read_tokens,
            "negative token counts in cost calculation"
        );
        return CostBreakdown::default();
    }

    let model = model.to_ascii_lowercase();
    let Some(entry) = lookup(&model) else {
        return CostBreakdown::default();
    };

    let high_tier = entry.input_high > 0.0 && input_tokens > tier_threshold(&model);
    let input_price = if high_tier { entry.input_high } else { entry.input };
    let output_price = if high_tier && entry.output_high > 0.0 {
        entry.output_high
    } else {
        entry.output
    };

    let input_usd = input_tokens as f64 * input_price / MILLION;
    let output_usd = output_tokens as f64 * output_price / MILLION;
    let cache_read_usd =
        cache_read_tokens as f64 * input_price * cache_read_multiplier(&model) / MILLION;
    let cache_write_usd = (cache_5m_write_tokens as f64 * CACHE_WRITE_5M_MULTIPLIER
        + cache_1h_write_tokens as f64 * CACHE_WRITE_1H_MULTIPLIER)
        * input_price
        / MILLION;

    CostBreakdown {
        input_usd,
        output_usd,
        cache_read_usd,
        cache_write_usd,
        total_usd: input_usd + output_usd + cache_read_usd + cache_write_usd,
    }
}

fn lookup(model: &str) -> Option<&'static PriceEntry> {
    let model = ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, base)| *base)
        .unwrap_or(model);

    if let Some(entry) = PRICES.iter().find(|entry| entry.model == model) {
        return Some(entry);
    }

    prefix_order()
        .iter()
        .find(|entry| model.starts_with(entry.model))
        .copied()
}

/// Base entries ordered longest name first, so the most specific prefix
/// matches before its generalizations.
fn prefix_order() -> &'static [&'static PriceEntry] {
    static ORDER: OnceLock<Vec<&'static PriceEntry>> = OnceLock::new();
    ORDER.get_or_init(|| {
        let mut entries: Vec<&'static PriceEntry> = PRICES.iter().collect();
        entries.sort_by(|a, b| {
            b.model
                .len()
                .cmp(&a.model.len())
                .then_with(|| b.model.cmp(a.model))
        });
        entries
    })
}

fn tier_threshold(model: &str) -> i64 {
    if model.starts_with("qwen-plus") {
        return QWEN_PLUS_TIER_THRESHOLD;
    }
    DEFAULT_TIER_THRESHOLD
}

/// Cache-read discount as a fraction of the input price. Claude and Gemini
/// read cache at 10%; OpenAI varies by family.
fn cache_read_multiplier(model: &str) -> f64 {
    if model.starts_with("claude") || model.contains("gemini") {
        return 0.1;
    }
    if model.starts_with("gpt-5") {
        return 0.1;
    }
    if model.starts_with("gpt-4.1")
        || model.starts_with("o4")
        || model.starts_with("codex-mini")
        || (model.starts_with("o3") && !model.contains("mini"))
    {
        return 0.25;
    }
    if is_openai_family(model) {
        return 0.5;
    }
    0.1
}

fn is_openai_family(model: &str) -> bool {
    if model.starts_with("gpt-") || model.contains("codex") {
        return true;
    }
    let mut chars = model.chars();
    chars.next() == Some('o') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_tokens_cost_nothing() {
        for model in ["claude-sonnet-4-5", "gpt-4o", "gemini-2.5-pro", "o3"] {
            assert_eq!(calculate_cost(model, 0, 0, 0, 0, 0), 0.0, "{model}");
        }
    }

    #[test]
    fn unknown_model_costs_nothing() {
        assert_eq!(calculate_cost("mystery-model-9000", 1000, 1000, 0, 0, 0), 0.0);
    }

    #[test]
    fn negative_tokens_cost_nothing() {
        assert_eq!(calculate_cost("claude-sonnet-4-5", -1, 10, 0, 0, 0), 0.0);
        assert_eq!(calculate_cost("claude-sonnet-4-5", 10, 10, -5, 0, 0), 0.0);
    }

    #[test]
    fn sonnet_45_with_cache_matches_reference_value() {
        let breakdown =
            calculate_cost_detailed("claude-sonnet-4-5-20250929", 12, 73, 17558, 278, 0);
        assert!(
            (breakdown.total_usd - 0.007441).abs() < 1e-6,
            "got {}",
            breakdown.total_usd
        );
        assert!((breakdown.input_usd - 0.000036).abs() < 1e-9);
        assert!((breakdown.output_usd - 0.001095).abs() < 1e-9);
    }

    #[test]
    fn gpt_51_codex_billable_input_matches_reference_value() {
        // Billable input 10309 - 6016 = 4293, cached 6016 at a 10% read rate.
        let total = calculate_cost("gpt-5.1-codex", 4293, 17, 6016, 0, 0);
        assert!((total - 0.006288).abs() < 1e-6, "got {total}");
    }

    #[test]
    fn cache_reads_are_cheaper_than_fresh_input() {
        for model in [
            "claude-sonnet-4-5",
            "claude-opus-4-1",
            "gpt-5.1",
            "gpt-4.1",
            "gpt-4o",
            "o1",
            "o3",
            "o3-mini",
            "gemini-2.5-pro",
        ] {
            let cached = calculate_cost(model, 0, 0, 10_000, 0, 0);
            let fresh = calculate_cost(model, 10_000, 0, 0, 0, 0);
            assert!(cached < fresh, "{model}: cached {cached} fresh {fresh}");
        }
    }

    #[test]
    fn cache_writes_are_dearer_than_fresh_input() {
        let write_5m = calculate_cost("claude-sonnet-4-5", 0, 0, 0, 10_000, 0);
        let write_1h = calculate_cost("claude-sonnet-4-5", 0, 0, 0, 0, 10_000);
        let fresh = calculate_cost("claude-sonnet-4-5", 10_000, 0, 0, 0, 0);
        assert!(write_5m > fresh);
        assert!(write_1h > write_5m);
    }

    #[test]
    fn specific_prefixes_beat_general_ones() {
        // gpt-5.1-codex-mini must not be priced as gpt-5.1-codex or gpt-5.
        let mini = calculate_cost("gpt-5.1-codex-mini-20251120", 1_000_000, 0, 0, 0, 0);
        assert!((mini - 0.25).abs() < 1e-9, "got {mini}");
        let codex = calculate_cost("gpt-5.1-codex-20251120", 1_000_000, 0, 0, 0, 0);
        assert!((codex - 1.25).abs() < 1e-9, "got {codex}");
        // o1-mini must not be priced as o1.
        let o1_mini = calculate_cost("o1-mini-2024-09-12", 1_000_000, 0, 0, 0, 0);
        assert!((o1_mini - 1.1).abs() < 1e-9, "got {o1_mini}");
    }

    #[test]
    fn aliases_resolve_before_prefixes() {
        let aliased = calculate_cost("chatgpt-4o-latest", 1_000_000, 0, 0, 0, 0);
        assert!((aliased - 2.5).abs() < 1e-9, "got {aliased}");
    }

    #[test]
    fn gemini_long_context_applies_high_tier_to_both_sides() {
        let below = calculate_cost_detailed("gemini-2.5-pro", 200_000, 1_000, 0, 0, 0);
        assert!((below.input_usd - 0.25).abs() < 1e-9);
        assert!((below.output_usd - 0.01).abs() < 1e-9);

        let above = calculate_cost_detailed("gemini-2.5-pro", 200_001, 1_000, 0, 0, 0);
        assert!((above.input_usd - 200_001.0 * 2.5 / 1_000_000.0).abs() < 1e-9);
        assert!((above.output_usd - 0.015).abs() < 1e-9);
    }

    #[test]
    fn qwen_plus_uses_the_larger_threshold() {
        let below = calculate_cost_detailed("qwen-plus", 256_000, 0, 0, 0, 0);
        assert!((below.input_usd - 256_000.0 * 0.4 / 1_000_000.0).abs() < 1e-9);
        let above = calculate_cost_detailed("qwen-plus", 256_001, 0, 0, 0, 0);
        assert!((above.input_usd - 256_001.0 * 1.2 / 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn models_without_high_tier_ignore_the_threshold() {
        let huge = calculate_cost_detailed("claude-sonnet-4-5", 500_000, 0, 0, 0, 0);
        assert!((huge.input_usd - 1.5).abs() < 1e-9);
    }

    #[test]
    fn openai_cache_read_multipliers_by_family() {
        // 10k cached tokens against each family's input price.
        let cases = [
            ("gpt-5.1", 1.25, 0.1),
            ("gpt-4.1", 2.0, 0.25),
            ("o3", 2.0, 0.25),
            ("o4-mini", 1.1, 0.25),
            ("codex-mini-latest", 1.5, 0.25),
            ("gpt-4o", 2.5, 0.5),
            ("o1", 15.0, 0.5),
            ("o1-mini", 1.1, 0.5),
            ("o3-mini", 1.1, 0.5),
        ];
        for (model, input_price, multiplier) in cases {
            let expected = 10_000.0 * input_price * multiplier / 1_000_000.0;
            let breakdown = calculate_cost_detailed(model, 0, 0, 10_000, 0, 0);
            assert!(
                (breakdown.cache_read_usd - expected).abs() < 1e-9,
                "{model}: got {} want {expected}",
                breakdown.cache_read_usd
            );
        }
    }
}
