use std::collections::HashMap;

use async_trait::async_trait;

use ccload_common::{ApiKey, AuthToken, Channel, ChannelType, KeyStrategy, LogEntry, ModelEntry};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid channel config: {0}")]
    InvalidConfig(#[from] ccload_common::ModelConfigError),
}

/// Admin-supplied channel fields. Cooldown state and `key_count` are owned
/// by the store itself.
#[derive(Debug, Clone)]
pub struct ChannelDraft {
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: String,
    pub priority: i64,
    pub enabled: bool,
    pub models: Vec<ModelEntry>,
    pub daily_cost_limit_usd: f64,
}

/// Token creation input. The caller hashes the plaintext; only the hash
/// crosses this boundary.
#[derive(Debug, Clone)]
pub struct AuthTokenDraft {
    pub token_hash: String,
    pub description: String,
    pub expires_at_ms: Option<i64>,
    pub allowed_models: Vec<String>,
    pub cost_limit_micro_usd: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub channel_id: Option<i64>,
    pub model: Option<String>,
    pub status_code: Option<i32>,
}

/// Persistence port consumed by the dispatch core.
///
/// Cooldown values are unix seconds. `bump_*` operations apply the backoff
/// policy internally as a read-modify-write under row-level locking, so
/// concurrent bumps against the same row serialize in the store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_config(&self, id: i64) -> StoreResult<Channel>;
    async fn list_configs(&self) -> StoreResult<Vec<Channel>>;
    async fn create_config(&self, draft: ChannelDraft) -> StoreResult<Channel>;
    async fn update_config(&self, id: i64, draft: ChannelDraft) -> StoreResult<Channel>;

    async fn get_api_keys(&self, channel_id: i64) -> StoreResult<Vec<ApiKey>>;
    async fn create_api_key(
        &self,
        channel_id: i64,
        api_key: &str,
        key_strategy: KeyStrategy,
    ) -> StoreResult<ApiKey>;
    /// All currently stored key cooldowns, keyed by `(channel_id, key_index)`.
    async fn get_all_key_cooldowns(&self) -> StoreResult<HashMap<(i64, i32), i64>>;

    /// Applies the backoff policy to one key; returns the new `until`.
    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i32,
        now: i64,
        status: u16,
    ) -> StoreResult<i64>;
    /// Sets a key cooldown to an absolute instant (quota reset times).
    async fn set_key_cooldown(&self, channel_id: i64, key_index: i32, until: i64)
    -> StoreResult<()>;
    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i32) -> StoreResult<()>;

    async fn bump_channel_cooldown(&self, channel_id: i64, now: i64, status: u16)
    -> StoreResult<i64>;
    async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> StoreResult<()>;
    async fn reset_channel_cooldown(&self, channel_id: i64) -> StoreResult<()>;

    async fn add_log(&self, entry: LogEntry) -> StoreResult<()>;
    async fn list_logs(
        &self,
        since: i64,
        limit: usize,
        offset: usize,
        filter: Option<LogFilter>,
    ) -> StoreResult<Vec<LogEntry>>;

    async fn get_auth_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<AuthToken>>;
    async fn create_auth_token(&self, draft: AuthTokenDraft) -> StoreResult<AuthToken>;
    /// Atomic integer addition on the token's cost accumulator.
    async fn add_token_cost(&self, token_id: i64, delta_micro_usd: i64) -> StoreResult<()>;
    async fn touch_token_last_used(&self, token_id: i64, at_ms: i64) -> StoreResult<()>;
}
