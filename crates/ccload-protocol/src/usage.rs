//! Token-usage extraction from vendor response payloads.
//!
//! The proxy bills from whatever usage shape the upstream emits: Anthropic
//! `message_start`/`message_delta` events, OpenAI chat-completion and
//! Responses usage blocks, or Gemini `usageMetadata`. The normalization
//! contract with the cost calculator: `input_tokens` is the *billable*
//! input. OpenAI reports gross `prompt_tokens`, so cached tokens are
//! subtracted here; Anthropic and Gemini inputs pass through as-is.

use serde_json::Value;

use crate::sse::SseEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    /// Billable input tokens (net of cached tokens for OpenAI shapes).
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    /// Total cache-creation tokens (Anthropic).
    pub cache_creation_tokens: i64,
    pub cache_5m_write_tokens: i64,
    pub cache_1h_write_tokens: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PartialUsage {
    input: Option<i64>,
    output: Option<i64>,
    cache_read: Option<i64>,
    cache_creation: Option<i64>,
    cache_5m: Option<i64>,
    cache_1h: Option<i64>,
}

impl PartialUsage {
    fn is_empty(&self) -> bool {
        self.input.is_none() && self.output.is_none()
    }
}

/// Observes parsed SSE events, accumulating usage and remembering the first
/// `error` event. Anthropic splits usage across `message_start` (input and
/// cache counters) and `message_delta` (output), so fields merge as they
/// appear.
#[derive(Debug, Default)]
pub struct UsageCollector {
    usage: StreamUsage,
    has_usage: bool,
    error_data: Option<String>,
    saw_done: bool,
}

impl UsageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &SseEvent) {
        if event.is_done() {
            self.saw_done = true;
            return;
        }
        if event.data.is_empty() {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };
        if event.is_error_event()
            || value.get("type").and_then(Value::as_str) == Some("error")
        {
            if self.error_data.is_none() {
                self.error_data = Some(event.data.clone());
            }
            return;
        }
        if let Some(partial) = partial_from_value(&value) {
            self.merge(partial);
        }
    }

    pub fn usage(&self) -> Option<StreamUsage> {
        self.has_usage.then_some(self.usage)
    }

    pub fn error_data(&self) -> Option<&str> {
        self.error_data.as_deref()
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }

    fn merge(&mut self, partial: PartialUsage) {
        self.has_usage = true;
        if let Some(input) = partial.input {
            self.usage.input_tokens = input;
        }
        if let Some(output) = partial.output {
            self.usage.output_tokens = output;
        }
        if let Some(cache_read) = partial.cache_read {
            self.usage.cache_read_tokens = cache_read;
        }
        if let Some(creation) = partial.cache_creation {
            self.usage.cache_creation_tokens = creation;
        }
        if let Some(cache_5m) = partial.cache_5m {
            self.usage.cache_5m_write_tokens = cache_5m;
        }
        if let Some(cache_1h) = partial.cache_1h {
            self.usage.cache_1h_write_tokens = cache_1h;
        }
    }
}

/// Extracts usage from a complete (non-streaming) JSON response body.
pub fn extract_usage_from_json(body: &[u8]) -> Option<StreamUsage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let partial = partial_from_value(&value)?;
    Some(StreamUsage {
        input_tokens: partial.input.unwrap_or(0),
        output_tokens: partial.output.unwrap_or(0),
        cache_read_tokens: partial.cache_read.unwrap_or(0),
        cache_creation_tokens: partial.cache_creation.unwrap_or(0),
        cache_5m_write_tokens: partial.cache_5m.unwrap_or(0),
        cache_1h_write_tokens: partial.cache_1h.unwrap_or(0),
    })
}

fn partial_from_value(value: &Value) -> Option<PartialUsage> {
    if let Some(metadata) = value.get("usageMetadata") {
        return gemini_partial(metadata);
    }

    let usage = value
        .get("usage")
        .or_else(|| value.get("message").and_then(|message| message.get("usage")))
        .or_else(|| value.get("response").and_then(|response| response.get("usage")))?;

    if usage.get("prompt_tokens").is_some() {
        return openai_chat_partial(usage);
    }
    if usage.get("input_tokens_details").is_some() {
        return openai_responses_partial(usage);
    }
    anthropic_partial(usage)
}

fn anthropic_partial(usage: &Value) -> Option<PartialUsage> {
    let partial = PartialUsage {
        input: field(usage, "input_tokens"),
        output: field(usage, "output_tokens"),
        cache_read: field(usage, "cache_read_input_tokens"),
        cache_creation: field(usage, "cache_creation_input_tokens"),
        cache_5m: usage
            .get("cache_creation")
            .and_then(|nested| field(nested, "ephemeral_5m_input_tokens")),
        cache_1h: usage
            .get("cache_creation")
            .and_then(|nested| field(nested, "ephemeral_1h_input_tokens")),
    };
    if partial.is_empty() {
        return None;
    }
    // Without an explicit split, cache writes default to the 5-minute tier.
    let partial = match (partial.cache_creation, partial.cache_5m) {
        (Some(total), None) => PartialUsage {
            cache_5m: Some(total),
            ..partial
        },
        _ => partial,
    };
    Some(partial)
}

fn openai_chat_partial(usage: &Value) -> Option<PartialUsage> {
    let prompt = field(usage, "prompt_tokens")?;
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|details| field(details, "cached_tokens"))
        .unwrap_or(0);
    Some(PartialUsage {
        input: Some((prompt - cached).max(0)),
        output: field(usage, "completion_tokens"),
        cache_read: Some(cached),
        ..PartialUsage::default()
    })
}

fn openai_responses_partial(usage: &Value) -> Option<PartialUsage> {
    let input = field(usage, "input_tokens")?;
    let cached = usage
        .get("input_tokens_details")
        .and_then(|details| field(details, "cached_tokens"))
        .unwrap_or(0);
    Some(PartialUsage {
        input: Some((input - cached).max(0)),
        output: field(usage, "output_tokens"),
        cache_read: Some(cached),
        ..PartialUsage::default()
    })
}

fn gemini_partial(metadata: &Value) -> Option<PartialUsage> {
    let prompt = field(metadata, "promptTokenCount");
    let candidates = field(metadata, "candidatesTokenCount");
    if prompt.is_none() && candidates.is_none() {
        return None;
    }
    Some(PartialUsage {
        input: prompt,
        output: candidates,
        cache_read: field(metadata, "cachedContentTokenCount"),
        ..PartialUsage::default()
    })
}

fn field(value: &Value, name: &str) -> Option<i64> {
    value.get(name).and_then(Value::as_i64)
}
