//! In-memory `Store` used by tests and ephemeral runs. Semantics mirror the
//! SQL store: bump operations apply the backoff policy under the same lock
//! that guards the rows, so concurrent bumps serialize.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use ccload_common::{
    ApiKey, AuthToken, Channel, CooldownSettings, KeyStrategy, LogEntry, next_cooldown,
    validate_models,
};

use crate::store::{
    AuthTokenDraft, ChannelDraft, LogFilter, Store, StoreError, StoreResult,
};

#[derive(Default)]
struct Inner {
    channels: BTreeMap<i64, Channel>,
    keys: BTreeMap<i64, Vec<ApiKey>>,
    tokens: BTreeMap<i64, AuthToken>,
    logs: Vec<LogEntry>,
    next_channel_id: i64,
    next_key_id: i64,
    next_token_id: i64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    cooldowns: CooldownSettings,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(CooldownSettings::default())
    }
}

impl MemoryStore {
    pub fn new(cooldowns: CooldownSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cooldowns,
        }
    }

    /// Seeds a fully formed channel, keeping `key_count` as given.
    pub fn insert_channel(&self, channel: Channel) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.next_channel_id = inner.next_channel_id.max(channel.id);
        inner.keys.entry(channel.id).or_default();
        inner.channels.insert(channel.id, channel);
    }

    /// Seeds a key and refreshes the owning channel's `key_count`.
    pub fn insert_api_key(&self, key: ApiKey) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.next_key_id = inner.next_key_id.max(key.id);
        let channel_id = key.channel_id;
        let keys = inner.keys.entry(channel_id).or_default();
        keys.retain(|existing| existing.key_index != key.key_index);
        keys.push(key);
        keys.sort_by_key(|key| key.key_index);
        let count = keys.len() as i64;
        if let Some(channel) = inner.channels.get_mut(&channel_id) {
            channel.key_count = count;
        }
    }

    pub fn insert_auth_token(&self, token: AuthToken) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.next_token_id = inner.next_token_id.max(token.id);
        inner.tokens.insert(token.id, token);
    }

    pub fn logged_entries(&self) -> Vec<LogEntry> {
        self.inner.lock().expect("memory store lock").logs.clone()
    }
}

fn set_duration_ms_for_until(until: i64) -> i64 {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    until.saturating_sub(now).max(0) * 1000
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_config(&self, id: i64) -> StoreResult<Channel> {
        let inner = self.inner.lock().expect("memory store lock");
        inner
            .channels
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("channel"))
    }

    async fn list_configs(&self) -> StoreResult<Vec<Channel>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner.channels.values().cloned().collect())
    }

    async fn create_config(&self, draft: ChannelDraft) -> StoreResult<Channel> {
        validate_models(&draft.models)?;
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.next_channel_id += 1;
        let id = inner.next_channel_id;
        let channel = Channel::from_parts(
            id,
            draft.name,
            draft.channel_type,
            draft.base_url,
            draft.priority,
            draft.enabled,
            draft.models,
            0,
            0,
            draft.daily_cost_limit_usd,
            0,
        );
        inner.channels.insert(id, channel.clone());
        inner.keys.entry(id).or_default();
        Ok(channel)
    }

    async fn update_config(&self, id: i64, draft: ChannelDraft) -> StoreResult<Channel> {
        validate_models(&draft.models)?;
        let mut inner = self.inner.lock().expect("memory store lock");
        let existing = inner
            .channels
            .get(&id)
            .ok_or(StoreError::NotFound("channel"))?;
        let channel = Channel::from_parts(
            id,
            draft.name,
            draft.channel_type,
            draft.base_url,
            draft.priority,
            draft.enabled,
            draft.models,
            existing.cooldown_until,
            existing.cooldown_duration_ms,
            draft.daily_cost_limit_usd,
            existing.key_count,
        );
        inner.channels.insert(id, channel.clone());
        Ok(channel)
    }

    async fn get_api_keys(&self, channel_id: i64) -> StoreResult<Vec<ApiKey>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner.keys.get(&channel_id).cloned().unwrap_or_default())
    }

    async fn create_api_key(
        &self,
        channel_id: i64,
        api_key: &str,
        key_strategy: KeyStrategy,
    ) -> StoreResult<ApiKey> {
        let mut inner = self.inner.lock().expect("memory store lock");
        if !inner.channels.contains_key(&channel_id) {
            return Err(StoreError::NotFound("channel"));
        }
        inner.next_key_id += 1;
        let id = inner.next_key_id;
        let keys = inner.keys.entry(channel_id).or_default();
        let key_index = keys.iter().map(|key| key.key_index + 1).max().unwrap_or(0);
        let key = ApiKey {
            id,
            channel_id,
            key_index,
            api_key: api_key.to_string(),
            key_strategy,
            cooldown_until: 0,
            cooldown_duration_ms: 0,
        };
        keys.push(key.clone());
        let count = keys.len() as i64;
        if let Some(channel) = inner.channels.get_mut(&channel_id) {
            channel.key_count = count;
        }
        Ok(key)
    }

    async fn get_all_key_cooldowns(&self) -> StoreResult<HashMap<(i64, i32), i64>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner
            .keys
            .values()
            .flatten()
            .map(|key| ((key.channel_id, key.key_index), key.cooldown_until))
            .collect())
    }

    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i32,
        now: i64,
        status: u16,
    ) -> StoreResult<i64> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let key = inner
            .keys
            .get_mut(&channel_id)
            .and_then(|keys| keys.iter_mut().find(|key| key.key_index == key_index))
            .ok_or(StoreError::NotFound("api key"))?;
        let prev = Duration::from_millis(key.cooldown_duration_ms.max(0) as u64);
        let next = next_cooldown(prev, key.cooldown_until, now, status, &self.cooldowns);
        key.cooldown_until = now + next.as_secs() as i64;
        key.cooldown_duration_ms = next.as_millis() as i64;
        Ok(key.cooldown_until)
    }

    async fn set_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i32,
        until: i64,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let key = inner
            .keys
            .get_mut(&channel_id)
            .and_then(|keys| keys.iter_mut().find(|key| key.key_index == key_index))
            .ok_or(StoreError::NotFound("api key"))?;
        key.cooldown_until = until;
        key.cooldown_duration_ms = set_duration_ms_for_until(until);
        Ok(())
    }

    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i32) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let key = inner
            .keys
            .get_mut(&channel_id)
            .and_then(|keys| keys.iter_mut().find(|key| key.key_index == key_index))
            .ok_or(StoreError::NotFound("api key"))?;
        key.cooldown_until = 0;
        key.cooldown_duration_ms = 0;
        Ok(())
    }

    async fn bump_channel_cooldown(
        &self,
        channel_id: i64,
        now: i64,
        status: u16,
    ) -> StoreResult<i64> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(StoreError::NotFound("channel"))?;
        let prev = Duration::from_millis(channel.cooldown_duration_ms.max(0) as u64);
        let next = next_cooldown(prev, channel.cooldown_until, now, status, &self.cooldowns);
        channel.cooldown_until = now + next.as_secs() as i64;
        channel.cooldown_duration_ms = next.as_millis() as i64;
        Ok(channel.cooldown_until)
    }

    async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(StoreError::NotFound("channel"))?;
        channel.cooldown_until = until;
        channel.cooldown_duration_ms = set_duration_ms_for_until(until);
        Ok(())
    }

    async fn reset_channel_cooldown(&self, channel_id: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let channel = inner
            .channels
            .get_mut(&channel_id)
            .ok_or(StoreError::NotFound("channel"))?;
        channel.cooldown_until = 0;
        channel.cooldown_duration_ms = 0;
        Ok(())
    }

    async fn add_log(&self, entry: LogEntry) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.logs.push(entry);
        Ok(())
    }

    async fn list_logs(
        &self,
        since: i64,
        limit: usize,
        offset: usize,
        filter: Option<LogFilter>,
    ) -> StoreResult<Vec<LogEntry>> {
        let inner = self.inner.lock().expect("memory store lock");
        let filter = filter.unwrap_or_default();
        let mut rows: Vec<LogEntry> = inner
            .logs
            .iter()
            .filter(|entry| entry.time.unix() >= since)
            .filter(|entry| {
                filter
                    .channel_id
                    .is_none_or(|channel_id| entry.channel_id == Some(channel_id))
            })
            .filter(|entry| filter.model.as_deref().is_none_or(|model| entry.model == model))
            .filter(|entry| {
                filter
                    .status_code
                    .is_none_or(|status| entry.status_code == status)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_auth_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<AuthToken>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner
            .tokens
            .values()
            .find(|token| token.token_hash == token_hash)
            .cloned())
    }

    async fn create_auth_token(&self, draft: AuthTokenDraft) -> StoreResult<AuthToken> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.next_token_id += 1;
        let token = AuthToken {
            id: inner.next_token_id,
            token_hash: draft.token_hash,
            description: draft.description,
            expires_at_ms: draft.expires_at_ms,
            last_used_at_ms: None,
            is_active: true,
            allowed_models: draft.allowed_models,
            cost_used_micro_usd: 0,
            cost_limit_micro_usd: draft.cost_limit_micro_usd,
        };
        inner.tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn add_token_cost(&self, token_id: i64, delta_micro_usd: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or(StoreError::NotFound("auth token"))?;
        token.cost_used_micro_usd += delta_micro_usd;
        Ok(())
    }

    async fn touch_token_last_used(&self, token_id: i64, at_ms: i64) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or(StoreError::NotFound("auth token"))?;
        token.last_used_at_ms = Some(at_ms);
        Ok(())
    }
}
