use std::sync::Arc;

use http::{HeaderMap, HeaderValue};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use ccload_common::{ApiKey, Channel, ChannelType, KeyStrategy};
use ccload_core::cooldown::{Action, CooldownManager};
use ccload_storage::{MemoryStore, Store};

const QUOTA_BODY: &str = "{\"type\":\"error\",\"error\":{\"type\":\"1308\",\"message\":\"quota exhausted, resets at 2025-12-09 18:08:11 \u{91cd}\u{7f6e}\u{3002}\"}}";

fn channel(id: i64, key_count: i64) -> Channel {
    Channel::from_parts(
        id,
        format!("ch-{id}"),
        ChannelType::Anthropic,
        "https://api.example.com".to_string(),
        0,
        true,
        Vec::new(),
        0,
        0,
        0.0,
        key_count,
    )
}

fn key(channel_id: i64, key_index: i32) -> ApiKey {
    ApiKey {
        id: channel_id * 10 + i64::from(key_index),
        channel_id,
        key_index,
        api_key: format!("sk-{channel_id}-{key_index}"),
        key_strategy: KeyStrategy::Sequential,
        cooldown_until: 0,
        cooldown_duration_ms: 0,
    }
}

fn store_with_keys(channel_id: i64, key_count: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::default());
    store.insert_channel(channel(channel_id, key_count));
    for index in 0..key_count {
        store.insert_api_key(key(channel_id, index as i32));
    }
    store
}

fn expected_reset_unix() -> i64 {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let parsed = PrimitiveDateTime::parse("2025-12-09 18:08:11", &format).unwrap();
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    parsed.assume_offset(offset).unix_timestamp()
}

#[tokio::test]
async fn quota_1308_on_multi_key_channel_sets_key_reset_time() {
    let store = store_with_keys(1, 2);
    let manager = CooldownManager::new(store.clone());

    let action = manager
        .handle_error(1, 0, 429, QUOTA_BODY.as_bytes(), false, None)
        .await;
    assert_eq!(action, Action::RetryKey);

    let keys = store.get_api_keys(1).await.unwrap();
    let expected = expected_reset_unix();
    assert!(
        (keys[0].cooldown_until - expected).abs() <= 2,
        "got {} want {expected}",
        keys[0].cooldown_until
    );
    // The sibling key is untouched.
    assert_eq!(keys[1].cooldown_until, 0);
    // No channel-level cooldown for a key-scoped quota error.
    assert_eq!(store.get_config(1).await.unwrap().cooldown_until, 0);
}

#[tokio::test]
async fn quota_1308_on_single_key_channel_stays_on_the_key() {
    let store = store_with_keys(1, 1);
    let manager = CooldownManager::new(store.clone());

    // 1308 carries its own reset instant, so the single-key escalation is
    // suppressed and the key keeps the fault.
    let action = manager
        .handle_error(1, 0, 429, QUOTA_BODY.as_bytes(), false, None)
        .await;
    assert_eq!(action, Action::RetryKey);

    let keys = store.get_api_keys(1).await.unwrap();
    let expected = expected_reset_unix();
    assert!((keys[0].cooldown_until - expected).abs() <= 2);
    assert_eq!(store.get_config(1).await.unwrap().cooldown_until, 0);
}

#[tokio::test]
async fn auth_error_on_single_key_channel_escalates_to_channel() {
    let store = store_with_keys(1, 1);
    let manager = CooldownManager::new(store.clone());

    let action = manager
        .handle_error(
            1,
            0,
            401,
            br#"{"error":{"type":"authentication_error"}}"#,
            false,
            None,
        )
        .await;
    assert_eq!(action, Action::RetryChannel);

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let channel = store.get_config(1).await.unwrap();
    // 401 starts at the auth cooldown (5 minutes).
    assert!((channel.cooldown_until - (now + 300)).abs() <= 2);
    // The key row stays untouched.
    let keys = store.get_api_keys(1).await.unwrap();
    assert_eq!(keys[0].cooldown_until, 0);
}

#[tokio::test]
async fn auth_error_on_multi_key_channel_cools_only_the_key() {
    let store = store_with_keys(1, 3);
    let manager = CooldownManager::new(store.clone());

    let action = manager
        .handle_error(
            1,
            1,
            401,
            br#"{"error":{"type":"authentication_error"}}"#,
            false,
            None,
        )
        .await;
    assert_eq!(action, Action::RetryKey);

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let keys = store.get_api_keys(1).await.unwrap();
    assert_eq!(keys[0].cooldown_until, 0);
    assert!((keys[1].cooldown_until - (now + 300)).abs() <= 2);
    assert_eq!(keys[2].cooldown_until, 0);
    assert_eq!(store.get_config(1).await.unwrap().cooldown_until, 0);
}

#[tokio::test]
async fn long_retry_after_rate_limit_cools_the_channel() {
    let store = store_with_keys(1, 2);
    let manager = CooldownManager::new(store.clone());

    let mut headers = HeaderMap::new();
    headers.insert("retry-after", HeaderValue::from_static("120"));
    let action = manager
        .handle_error(1, 0, 429, br#"{"error":"rate limit"}"#, false, Some(&headers))
        .await;
    assert_eq!(action, Action::RetryChannel);

    let channel = store.get_config(1).await.unwrap();
    assert!(channel.cooldown_until > 0);
    let keys = store.get_api_keys(1).await.unwrap();
    assert_eq!(keys[0].cooldown_until, 0);
}

#[tokio::test]
async fn first_byte_timeout_cools_the_channel_for_one_minute() {
    let store = store_with_keys(1, 2);
    let manager = CooldownManager::new(store.clone());

    let action = manager.handle_error(1, 0, 598, b"", true, None).await;
    assert_eq!(action, Action::RetryChannel);

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let channel = store.get_config(1).await.unwrap();
    assert!((channel.cooldown_until - (now + 60)).abs() <= 2);
}

#[tokio::test]
async fn client_level_errors_apply_no_cooldown() {
    let store = store_with_keys(1, 2);
    let manager = CooldownManager::new(store.clone());

    let action = manager
        .handle_error(1, 0, 400, br#"{"error":{"message":"bad request"}}"#, false, None)
        .await;
    assert_eq!(action, Action::ReturnToClient);

    assert_eq!(store.get_config(1).await.unwrap().cooldown_until, 0);
    let keys = store.get_api_keys(1).await.unwrap();
    assert_eq!(keys[0].cooldown_until, 0);
}

#[tokio::test]
async fn store_failures_are_swallowed() {
    let store = Arc::new(MemoryStore::default());
    let manager = CooldownManager::new(store.clone());

    // Unknown channel: the key-count lookup fails, the level escalates, the
    // channel bump fails too, and the caller still gets a retry decision.
    let action = manager
        .handle_error(
            42,
            0,
            401,
            br#"{"error":{"type":"authentication_error"}}"#,
            false,
            None,
        )
        .await;
    assert_eq!(action, Action::RetryChannel);
}

#[tokio::test]
async fn repeated_channel_faults_back_off_exponentially() {
    let store = store_with_keys(1, 1);
    let manager = CooldownManager::new(store.clone());
    let now = OffsetDateTime::now_utc().unix_timestamp();

    manager.handle_error(1, 0, 503, b"", false, None).await;
    let first = store.get_config(1).await.unwrap();
    assert!((first.cooldown_until - (now + 120)).abs() <= 2);

    manager.handle_error(1, 0, 503, b"", false, None).await;
    let second = store.get_config(1).await.unwrap();
    assert!(second.cooldown_until >= first.cooldown_until + 120 - 2);
    assert_eq!(second.cooldown_duration_ms, 240_000);
}

#[tokio::test]
async fn success_clears_key_then_channel_cooldowns() {
    let store = store_with_keys(1, 2);
    let manager = CooldownManager::new(store.clone());

    store.set_key_cooldown(1, 0, 9_999_999_999).await.unwrap();
    store.set_channel_cooldown(1, 9_999_999_999).await.unwrap();

    let channel = store.get_config(1).await.unwrap();
    let keys = store.get_api_keys(1).await.unwrap();
    manager.clear_on_success(&channel, &keys[0]).await;

    assert_eq!(store.get_config(1).await.unwrap().cooldown_until, 0);
    assert_eq!(store.get_api_keys(1).await.unwrap()[0].cooldown_until, 0);
}
