use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::jsontime::JsonTime;

#[derive(Debug, thiserror::Error)]
pub enum ModelConfigError {
    #[error("model name must not be empty")]
    EmptyModelName,
    #[error("model name contains control characters: {0:?}")]
    ControlCharacters(String),
}

/// Upstream API dialect spoken by a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    #[default]
    Anthropic,
    Codex,
    Openai,
    Gemini,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::Anthropic => "anthropic",
            ChannelType::Codex => "codex",
            ChannelType::Openai => "openai",
            ChannelType::Gemini => "gemini",
        }
    }

    /// Lenient parse used when loading rows; unknown values fall back to the
    /// default channel type.
    pub fn parse_or_default(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "codex" => ChannelType::Codex,
            "openai" => ChannelType::Openai,
            "gemini" => ChannelType::Gemini,
            _ => ChannelType::Anthropic,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Sequential,
    RoundRobin,
}

impl KeyStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStrategy::Sequential => "sequential",
            KeyStrategy::RoundRobin => "round_robin",
        }
    }

    pub fn parse_or_default(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "round_robin" => KeyStrategy::RoundRobin,
            _ => KeyStrategy::Sequential,
        }
    }
}

/// One model exposed by a channel, optionally redirected to another name on
/// the outgoing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl ModelEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            redirect_to: None,
        }
    }
}

/// A logical upstream endpoint: vendor dialect, base URL, priority, and the
/// models it serves. Cooldown fields are mutated only by the cooldown
/// manager; everything else is admin-owned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub channel_type: ChannelType,
    pub base_url: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    /// Unix seconds; 0 means no active cooldown.
    #[serde(default)]
    pub cooldown_until: i64,
    /// Last applied cooldown duration, feeds exponential backoff.
    #[serde(default)]
    pub cooldown_duration_ms: i64,
    #[serde(default)]
    pub daily_cost_limit_usd: f64,
    /// Denormalized count of API keys under this channel.
    #[serde(default)]
    pub key_count: i64,
    #[serde(skip)]
    model_index: OnceLock<HashMap<String, usize>>,
}

fn default_enabled() -> bool {
    true
}

/// Validates a channel's model list: names must be non-empty and free of
/// control characters.
pub fn validate_models(models: &[ModelEntry]) -> Result<(), ModelConfigError> {
    for entry in models {
        if entry.name.is_empty() {
            return Err(ModelConfigError::EmptyModelName);
        }
        if entry.name.chars().any(char::is_control) {
            return Err(ModelConfigError::ControlCharacters(entry.name.clone()));
        }
    }
    Ok(())
}

impl Channel {
    pub fn validate(&self) -> Result<(), ModelConfigError> {
        validate_models(&self.models)
    }

    pub fn is_cooling(&self, now: i64) -> bool {
        self.cooldown_until > now
    }

    /// Exact (case-insensitive) model lookup. The index is built once on
    /// first access; the channel value is treated as immutable afterwards.
    pub fn model_entry(&self, model: &str) -> Option<&ModelEntry> {
        let index = self.model_index.get_or_init(|| {
            self.models
                .iter()
                .enumerate()
                .map(|(position, entry)| (entry.name.to_ascii_lowercase(), position))
                .collect()
        });
        index
            .get(&model.to_ascii_lowercase())
            .map(|position| &self.models[*position])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: i64,
        name: String,
        channel_type: ChannelType,
        base_url: String,
        priority: i64,
        enabled: bool,
        models: Vec<ModelEntry>,
        cooldown_until: i64,
        cooldown_duration_ms: i64,
        daily_cost_limit_usd: f64,
        key_count: i64,
    ) -> Self {
        Self {
            id,
            name,
            channel_type,
            base_url,
            priority,
            enabled,
            models,
            cooldown_until,
            cooldown_duration_ms,
            daily_cost_limit_usd,
            key_count,
            model_index: OnceLock::new(),
        }
    }
}

/// One credential under a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub channel_id: i64,
    /// Position within the channel, 0-based. Unique per channel.
    pub key_index: i32,
    pub api_key: String,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default)]
    pub cooldown_until: i64,
    #[serde(default)]
    pub cooldown_duration_ms: i64,
}

impl ApiKey {
    pub fn is_cooling(&self, now: i64) -> bool {
        self.cooldown_until > now
    }
}

/// Client-facing access credential. The plaintext is never stored; lookups
/// go through the SHA-256 hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    pub token_hash: String,
    #[serde(default)]
    pub description: String,
    /// Unix milliseconds; absent means no expiry.
    #[serde(default)]
    pub expires_at_ms: Option<i64>,
    #[serde(default)]
    pub last_used_at_ms: Option<i64>,
    pub is_active: bool,
    /// Empty list means all models are allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub cost_used_micro_usd: i64,
    /// 0 means unlimited.
    #[serde(default)]
    pub cost_limit_micro_usd: i64,
}

impl AuthToken {
    pub fn is_valid(&self, now_ms: i64) -> bool {
        self.is_active && self.expires_at_ms.is_none_or(|expires| expires > now_ms)
    }

    pub fn allows_model(&self, model: &str) -> bool {
        if self.allowed_models.is_empty() {
            return true;
        }
        self.allowed_models
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(model))
    }

    pub fn budget_exhausted(&self) -> bool {
        self.cost_limit_micro_usd > 0 && self.cost_used_micro_usd >= self.cost_limit_micro_usd
    }
}

/// One request's record, produced by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: JsonTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    pub model: String,
    pub status_code: i32,
    pub duration_s: f64,
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_byte_time_s: Option<f64>,
    pub api_key_masked: String,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_read_tokens: i64,
    #[serde(default)]
    pub cache_creation_tokens: i64,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_with_models(models: Vec<ModelEntry>) -> Channel {
        Channel::from_parts(
            1,
            "main".to_string(),
            ChannelType::Anthropic,
            "https://api.example.com".to_string(),
            10,
            true,
            models,
            0,
            0,
            0.0,
            1,
        )
    }

    #[test]
    fn model_entry_lookup_is_case_insensitive() {
        let channel = channel_with_models(vec![
            ModelEntry::new("claude-sonnet-4-5"),
            ModelEntry {
                name: "claude-opus-4-1".to_string(),
                redirect_to: Some("claude-opus-4-1-20250805".to_string()),
            },
        ]);

        assert!(channel.model_entry("CLAUDE-SONNET-4-5").is_some());
        let redirected = channel.model_entry("claude-opus-4-1").unwrap();
        assert_eq!(
            redirected.redirect_to.as_deref(),
            Some("claude-opus-4-1-20250805")
        );
        assert!(channel.model_entry("gpt-4o").is_none());
    }

    #[test]
    fn validate_rejects_control_characters() {
        let channel = channel_with_models(vec![ModelEntry::new("bad\nmodel")]);
        assert!(channel.validate().is_err());

        let channel = channel_with_models(vec![ModelEntry::new("")]);
        assert!(channel.validate().is_err());
    }

    #[test]
    fn token_validity_and_whitelist() {
        let token = AuthToken {
            id: 1,
            token_hash: "h".to_string(),
            description: String::new(),
            expires_at_ms: Some(2_000),
            last_used_at_ms: None,
            is_active: true,
            allowed_models: vec!["claude-sonnet-4-5".to_string()],
            cost_used_micro_usd: 0,
            cost_limit_micro_usd: 0,
        };

        assert!(token.is_valid(1_999));
        assert!(!token.is_valid(2_000));
        assert!(token.allows_model("Claude-Sonnet-4-5"));
        assert!(!token.allows_model("gpt-4o"));
    }

    #[test]
    fn empty_whitelist_allows_everything() {
        let token = AuthToken {
            id: 1,
            token_hash: "h".to_string(),
            description: String::new(),
            expires_at_ms: None,
            last_used_at_ms: None,
            is_active: true,
            allowed_models: Vec::new(),
            cost_used_micro_usd: 10,
            cost_limit_micro_usd: 0,
        };
        assert!(token.allows_model("anything"));
        assert!(!token.budget_exhausted());
    }
}
