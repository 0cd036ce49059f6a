//! Static price data, USD per million tokens. High-tier prices apply to the
//! whole request once billable input crosses the model family's tier
//! threshold; zero means the model has no high tier.

pub(super) struct PriceEntry {
    pub model: &'static str,
    pub input: f64,
    pub output: f64,
    pub input_high: f64,
    pub output_high: f64,
}

const fn flat(model: &'static str, input: f64, output: f64) -> PriceEntry {
    PriceEntry {
        model,
        input,
        output,
        input_high: 0.0,
        output_high: 0.0,
    }
}

const fn tiered(
    model: &'static str,
    input: f64,
    output: f64,
    input_high: f64,
    output_high: f64,
) -> PriceEntry {
    PriceEntry {
        model,
        input,
        output,
        input_high,
        output_high,
    }
}

pub(super) const PRICES: &[PriceEntry] = &[
    // Anthropic
    flat("claude-opus-4-1", 15.0, 75.0),
    flat("claude-opus-4", 15.0, 75.0),
    flat("claude-sonnet-4-5", 3.0, 15.0),
    flat("claude-sonnet-4", 3.0, 15.0),
    flat("claude-haiku-4-5", 1.0, 5.0),
    flat("claude-3-7-sonnet", 3.0, 15.0),
    flat("claude-3-5-sonnet", 3.0, 15.0),
    flat("claude-3-5-haiku", 0.8, 4.0),
    flat("claude-3-opus", 15.0, 75.0),
    flat("claude-3-haiku", 0.25, 1.25),
    // OpenAI / Codex
    flat("gpt-5.1-codex-mini", 0.25, 2.0),
    flat("gpt-5.1-codex", 1.25, 10.0),
    flat("gpt-5.1", 1.25, 10.0),
    flat("gpt-5-codex", 1.25, 10.0),
    flat("gpt-5-mini", 0.25, 2.0),
    flat("gpt-5-nano", 0.05, 0.4),
    flat("gpt-5", 1.25, 10.0),
    flat("gpt-4.1-mini", 0.4, 1.6),
    flat("gpt-4.1-nano", 0.1, 0.4),
    flat("gpt-4.1", 2.0, 8.0),
    flat("gpt-4o-mini", 0.15, 0.6),
    flat("gpt-4o", 2.5, 10.0),
    flat("o1-mini", 1.1, 4.4),
    flat("o1", 15.0, 60.0),
    flat("o3-mini", 1.1, 4.4),
    flat("o3", 2.0, 8.0),
    flat("o4-mini", 1.1, 4.4),
    flat("codex-mini-latest", 1.5, 6.0),
    // Gemini (long-context high tier above 200k input tokens)
    tiered("gemini-2.5-pro", 1.25, 10.0, 2.5, 15.0),
    flat("gemini-2.5-flash", 0.3, 2.5),
    flat("gemini-2.0-flash", 0.1, 0.4),
    tiered("gemini-1.5-pro", 1.25, 5.0, 2.5, 10.0),
    flat("gemini-1.5-flash", 0.075, 0.3),
    // Qwen (high tier above 256k input tokens)
    tiered("qwen-plus", 0.4, 1.2, 1.2, 3.6),
    flat("qwen-max", 1.6, 6.4),
    flat("qwen-turbo", 0.05, 0.2),
    // DeepSeek
    flat("deepseek-chat", 0.27, 1.1),
    flat("deepseek-reasoner", 0.55, 2.19),
];

/// Exact-name aliases resolved before the base table.
pub(super) const ALIASES: &[(&str, &str)] = &[
    ("claude-opus-4-latest", "claude-opus-4-1"),
    ("claude-3-5-sonnet-latest", "claude-3-5-sonnet"),
    ("claude-3-5-haiku-latest", "claude-3-5-haiku"),
    ("chatgpt-4o-latest", "gpt-4o"),
    ("gpt-4o-latest", "gpt-4o"),
    ("gemini-pro", "gemini-1.5-pro"),
    ("gemini-flash-latest", "gemini-2.5-flash"),
];
