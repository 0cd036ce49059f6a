//! Candidate ordering: which `(channel, key)` pairs to try, and in what
//! order. Channels sort by priority then id; keys follow the channel's key
//! strategy. Cooling channels and keys are skipped entirely.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use ccload_common::{ApiKey, Channel, ChannelType, KeyStrategy, ModelEntry};
use ccload_storage::Store;

#[derive(Debug, Clone)]
pub struct ChannelCandidate {
    pub channel: Channel,
    /// Redirect target for the outgoing request, when the matched model
    /// entry carries one.
    pub outgoing_model: Option<String>,
    /// Keys in try order, cooled keys already removed.
    pub keys: Vec<ApiKey>,
}

pub struct Selector {
    store: Arc<dyn Store>,
    round_robin: Mutex<HashMap<i64, u64>>,
}

impl Selector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            round_robin: Mutex::new(HashMap::new()),
        }
    }

    /// Produces the ordered candidate list for one request.
    pub async fn candidates(
        &self,
        channels: &[Channel],
        channel_type: ChannelType,
        model: &str,
        now: i64,
    ) -> Vec<ChannelCandidate> {
        let mut eligible: Vec<(&Channel, Option<String>)> = channels
            .iter()
            .filter(|channel| {
                channel.enabled
                    && channel.channel_type == channel_type
                    && !channel.is_cooling(now)
            })
            .filter_map(|channel| {
                resolve_model(channel, model)
                    .map(|entry| (channel, entry.redirect_to.clone()))
            })
            .collect();
        eligible.sort_by(|a, b| {
            b.0.priority
                .cmp(&a.0.priority)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });

        let mut out = Vec::new();
        for (channel, outgoing_model) in eligible {
            let keys = match self.store.get_api_keys(channel.id).await {
                Ok(keys) => keys,
                Err(err) => {
                    warn!(channel_id = channel.id, error = %err, "loading api keys failed");
                    continue;
                }
            };
            let keys = self.order_keys(channel.id, keys, now);
            if keys.is_empty() {
                continue;
            }
            out.push(ChannelCandidate {
                channel: channel.clone(),
                outgoing_model,
                keys,
            });
        }
        out
    }

    /// Sequential strategy walks keys by index; round-robin rotates the
    /// start position with a per-channel process-local counter. The counter
    /// is not persisted; a restart simply restarts the rotation.
    fn order_keys(&self, channel_id: i64, mut keys: Vec<ApiKey>, now: i64) -> Vec<ApiKey> {
        keys.sort_by_key(|key| key.key_index);
        let strategy = keys
            .first()
            .map(|key| key.key_strategy)
            .unwrap_or_default();
        if strategy == KeyStrategy::RoundRobin && keys.len() > 1 {
            let position = {
                let mut counters = self.round_robin.lock().expect("round robin lock");
                let counter = counters.entry(channel_id).or_insert(0);
                let current = *counter;
                *counter = counter.wrapping_add(1);
                current as usize % keys.len()
            };
            keys.rotate_left(position);
        }
        keys.into_iter().filter(|key| !key.is_cooling(now)).collect()
    }
}

/// Exact model lookup first, then fuzzy: case-insensitive substring in
/// either direction, ties broken by date suffix, version sequence, then
/// name, newest first.
pub fn resolve_model<'a>(channel: &'a Channel, model: &str) -> Option<&'a ModelEntry> {
    if let Some(entry) = channel.model_entry(model) {
        return Some(entry);
    }
    fuzzy_match(&channel.models, model)
}

fn fuzzy_match<'a>(models: &'a [ModelEntry], requested: &str) -> Option<&'a ModelEntry> {
    let requested = requested.to_ascii_lowercase();
    let mut matches: Vec<&ModelEntry> = models
        .iter()
        .filter(|entry| {
            let name = entry.name.to_ascii_lowercase();
            name.contains(&requested) || requested.contains(&name)
        })
        .collect();
    matches.sort_by(|a, b| compare_model_names(&b.name, &a.name));
    matches.into_iter().next()
}

fn compare_model_names(a: &str, b: &str) -> Ordering {
    date_suffix(a)
        .cmp(&date_suffix(b))
        .then_with(|| version_sequence(a).cmp(&version_sequence(b)))
        .then_with(|| a.cmp(b))
}

/// Trailing `YYYYMMDD` segment, 0 when absent.
fn date_suffix(name: &str) -> u64 {
    name.rsplit('-')
        .next()
        .filter(|segment| segment.len() == 8 && segment.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|segment| segment.parse().ok())
        .unwrap_or(0)
}

/// Every digit group in order, for numeric version comparison.
fn version_sequence(name: &str) -> Vec<u64> {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for ch in name.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            numbers.push(current.parse().unwrap_or(u64::MAX));
            current.clear();
        }
    }
    if !current.is_empty() {
        numbers.push(current.parse().unwrap_or(u64::MAX));
    }
    numbers
}
