use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use tracing::warn;

use ccload_common::Channel;
use ccload_storage::Store;

/// Read-through channel accessor. The cooldown manager takes this instead of
/// hitting the store on every classified error; readers may see a slightly
/// stale `key_count`, which is acceptable because the escalation rule is
/// conservative.
#[async_trait]
pub trait ConfigGetter: Send + Sync {
    async fn channel(&self, id: i64) -> Option<Channel>;
}

struct CacheEntry {
    loaded_at: Instant,
    channels: Vec<Channel>,
}

/// TTL cache over `Store::list_configs`. A failed refresh serves the stale
/// snapshot rather than failing the request.
pub struct CachedConfigs {
    store: Arc<dyn Store>,
    ttl: Duration,
    entry: ArcSwapOption<CacheEntry>,
}

impl CachedConfigs {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            entry: ArcSwapOption::const_empty(),
        }
    }

    pub async fn list(&self) -> Vec<Channel> {
        if let Some(entry) = self.entry.load_full()
            && entry.loaded_at.elapsed() < self.ttl
        {
            return entry.channels.clone();
        }
        match self.store.list_configs().await {
            Ok(channels) => {
                self.entry.store(Some(Arc::new(CacheEntry {
                    loaded_at: Instant::now(),
                    channels: channels.clone(),
                })));
                channels
            }
            Err(err) => {
                warn!(error = %err, "channel config refresh failed, serving stale snapshot");
                self.entry
                    .load_full()
                    .map(|entry| entry.channels.clone())
                    .unwrap_or_default()
            }
        }
    }

    pub async fn get(&self, id: i64) -> Option<Channel> {
        self.list().await.into_iter().find(|channel| channel.id == id)
    }
}

#[async_trait]
impl ConfigGetter for CachedConfigs {
    async fn channel(&self, id: i64) -> Option<Channel> {
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_common::ChannelType;
    use ccload_storage::{ChannelDraft, MemoryStore};

    fn draft(name: &str) -> ChannelDraft {
        ChannelDraft {
            name: name.to_string(),
            channel_type: ChannelType::Anthropic,
            base_url: "https://api.example.com".to_string(),
            priority: 0,
            enabled: true,
            models: Vec::new(),
            daily_cost_limit_usd: 0.0,
        }
    }

    #[tokio::test]
    async fn serves_cached_snapshot_within_ttl() {
        let store = Arc::new(MemoryStore::default());
        let cache = CachedConfigs::new(store.clone(), Duration::from_secs(60));

        store.create_config(draft("a")).await.unwrap();
        assert_eq!(cache.list().await.len(), 1);

        // A new channel is invisible until the TTL lapses.
        store.create_config(draft("b")).await.unwrap();
        assert_eq!(cache.list().await.len(), 1);
    }

    #[tokio::test]
    async fn zero_ttl_always_refreshes() {
        let store = Arc::new(MemoryStore::default());
        let cache = CachedConfigs::new(store.clone(), Duration::ZERO);

        store.create_config(draft("a")).await.unwrap();
        assert_eq!(cache.list().await.len(), 1);
        let created = store.create_config(draft("b")).await.unwrap();
        assert_eq!(cache.list().await.len(), 2);
        assert!(cache.channel(created.id).await.is_some());
    }
}
