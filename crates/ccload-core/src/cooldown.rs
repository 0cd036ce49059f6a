//! Consumes classifier output and turns it into cooldown writes plus a
//! retry decision for the dispatch loop. The loop never re-classifies; it
//! only switches on the returned [`Action`].

use std::sync::Arc;

use http::HeaderMap;
use time::OffsetDateTime;
use tracing::warn;

use ccload_common::{ApiKey, Channel};
use ccload_protocol::parse_quota_reset_time;
use ccload_storage::Store;

use crate::classify::{self, ErrorLevel};
use crate::config_cache::ConfigGetter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RetryKey,
    RetryChannel,
    ReturnToClient,
}

#[derive(Clone)]
pub struct CooldownManager {
    store: Arc<dyn Store>,
    configs: Option<Arc<dyn ConfigGetter>>,
}

impl CooldownManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            configs: None,
        }
    }

    pub fn with_config_getter(store: Arc<dyn Store>, configs: Arc<dyn ConfigGetter>) -> Self {
        Self {
            store,
            configs: Some(configs),
        }
    }

    /// Classifies one failed attempt and applies the matching cooldown.
    ///
    /// Store write failures are logged and swallowed: a stale cooldown row
    /// is preferable to failing the request.
    pub async fn handle_error(
        &self,
        channel_id: i64,
        key_index: i32,
        status: u16,
        body: &[u8],
        is_network_error: bool,
        headers: Option<&HeaderMap>,
    ) -> Action {
        let mut level = if is_network_error {
            if status == classify::STATUS_FIRST_BYTE_TIMEOUT || status == 504 {
                ErrorLevel::Channel
            } else {
                ErrorLevel::Key
            }
        } else if status == 429
            && let Some(headers) = headers
        {
            classify::classify_rate_limit(headers, body)
        } else {
            classify::classify_http_response(status, headers, body).level
        };

        let reset_time = parse_quota_reset_time(body);
        let has_1308 = reset_time.is_some();

        // A key-level fault on a single-key channel exhausts the channel;
        // escalate unless a 1308 reset pins the fault to the key itself.
        if level == ErrorLevel::Key && !has_1308 {
            match self.channel_key_count(channel_id).await {
                Some(count) if count > 1 => {}
                _ => level = ErrorLevel::Channel,
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        match level {
            ErrorLevel::None | ErrorLevel::Client => Action::ReturnToClient,
            ErrorLevel::Key if key_index >= 0 => {
                let write = match reset_time {
                    Some(reset) => {
                        self.store
                            .set_key_cooldown(channel_id, key_index, reset.unix_timestamp())
                            .await
                    }
                    None => self
                        .store
                        .bump_key_cooldown(channel_id, key_index, now, status)
                        .await
                        .map(|_| ()),
                };
                if let Err(err) = write {
                    warn!(
                        channel_id,
                        key_index,
                        status,
                        error = %err,
                        "key cooldown write failed"
                    );
                }
                Action::RetryKey
            }
            _ => {
                let write = match reset_time {
                    Some(reset) => {
                        self.store
                            .set_channel_cooldown(channel_id, reset.unix_timestamp())
                            .await
                    }
                    None => self
                        .store
                        .bump_channel_cooldown(channel_id, now, status)
                        .await
                        .map(|_| ()),
                };
                if let Err(err) = write {
                    warn!(channel_id, status, error = %err, "channel cooldown write failed");
                }
                Action::RetryChannel
            }
        }
    }

    /// First success after a cooldown clears it, key first, then channel.
    pub async fn clear_on_success(&self, channel: &Channel, key: &ApiKey) {
        if key.cooldown_until != 0 || key.cooldown_duration_ms != 0 {
            if let Err(err) = self.store.reset_key_cooldown(channel.id, key.key_index).await {
                warn!(
                    channel_id = channel.id,
                    key_index = key.key_index,
                    error = %err,
                    "key cooldown reset failed"
                );
            }
        }
        if channel.cooldown_until != 0 || channel.cooldown_duration_ms != 0 {
            if let Err(err) = self.store.reset_channel_cooldown(channel.id).await {
                warn!(channel_id = channel.id, error = %err, "channel cooldown reset failed");
            }
        }
    }

    async fn channel_key_count(&self, channel_id: i64) -> Option<i64> {
        if let Some(configs) = &self.configs {
            return configs
                .channel(channel_id)
                .await
                .map(|channel| channel.key_count);
        }
        self.store
            .get_config(channel_id)
            .await
            .ok()
            .map(|channel| channel.key_count)
    }
}
