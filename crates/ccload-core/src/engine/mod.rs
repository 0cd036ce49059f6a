//! The dispatch loop: authenticate, select candidates, try them in order,
//! stream the winning response to the client while observing usage, and
//! settle cost, logs, and cooldowns afterwards.

mod route;

pub use route::{Route, RouteError, classify_route};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use ccload_common::{
    ApiKey, AuthToken, Channel, JsonTime, LogEntry, mask_api_key, usd_to_micro_usd,
};
use ccload_protocol::{
    SseParser, StreamUsage, UsageCollector, extract_usage_from_json, is_quota_1308,
};
use ccload_storage::Store;

use crate::auth::AuthGate;
use crate::classify::{self, classify_transport, client_status_for};
use crate::config_cache::CachedConfigs;
use crate::cooldown::{Action, CooldownManager};
use crate::pricing;
use crate::select::{ChannelCandidate, Selector};
use crate::upstream::{
    PreparedRequest, UpstreamBody, UpstreamClient, UpstreamError, UpstreamResponse, build_attempt,
    headers_to_map,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline enclosing the whole dispatch loop for one request.
    pub request_timeout: Duration,
    /// TTL of the channel-config snapshot.
    pub config_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(600),
            config_ttl: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub enum ProxyResponse {
    Full {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    Stream {
        status: u16,
        headers: Vec<(String, String)>,
        body: mpsc::Receiver<Bytes>,
    },
}

pub struct ProxyEngine {
    store: Arc<dyn Store>,
    configs: Arc<CachedConfigs>,
    selector: Selector,
    cooldowns: CooldownManager,
    auth: AuthGate,
    client: Arc<dyn UpstreamClient>,
    config: EngineConfig,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn UpstreamClient>,
        config: EngineConfig,
    ) -> Self {
        let configs = Arc::new(CachedConfigs::new(store.clone(), config.config_ttl));
        let cooldowns = CooldownManager::with_config_getter(store.clone(), configs.clone());
        Self {
            selector: Selector::new(store.clone()),
            auth: AuthGate::new(store.clone()),
            store,
            configs,
            cooldowns,
            client,
            config,
        }
    }

    pub async fn dispatch(&self, request: ProxyRequest) -> ProxyResponse {
        let trace_id = Uuid::new_v4().to_string();
        let started_at = Instant::now();

        let route = match classify_route(
            &request.path,
            request.query.as_deref(),
            &request.headers,
            &request.body,
        ) {
            Ok(route) => route,
            Err(err) => return error_response(err.status(), &err.to_string()),
        };

        let token = match self.auth.authenticate(&request.headers).await {
            Ok(token) => token,
            Err(err) => return error_response(err.status(), &err.to_string()),
        };
        if let Err(err) = self.auth.authorize(&token, &route.model) {
            return error_response(err.status(), &err.to_string());
        }

        info!(
            event = "dispatch_begin",
            trace_id = %trace_id,
            model = %route.model,
            channel_type = route.channel_type.as_str(),
            is_stream = route.is_stream
        );

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let channels = self.configs.list().await;
        let candidates = self
            .selector
            .candidates(&channels, route.channel_type, &route.model, now)
            .await;

        let deadline = started_at + self.config.request_timeout;
        let mut last_failure: Option<(u16, Bytes)> = None;

        'channels: for candidate in candidates {
            for key in &candidate.keys {
                if Instant::now() >= deadline {
                    return error_response(504, "request deadline exceeded");
                }

                let prepared = build_attempt(
                    &candidate.channel,
                    key,
                    &request.path,
                    request.query.as_deref(),
                    candidate.outgoing_model.as_deref(),
                    &request.body,
                    route.is_stream,
                );

                let attempt_started = Instant::now();
                let outcome = self.attempt(prepared, deadline).await;
                let first_byte_s = attempt_started.elapsed().as_secs_f64();

                match outcome {
                    Err(UpstreamError::Canceled) => {
                        self.settle_ctx(&trace_id, &candidate, key, &route, &token, started_at, None)
                            .log_only(499, "client canceled")
                            .await;
                        return error_response(499, "client canceled");
                    }
                    Err(error) => {
                        let classified = classify_transport(&error);
                        warn!(
                            event = "upstream_attempt_failed",
                            trace_id = %trace_id,
                            channel_id = candidate.channel.id,
                            key_index = key.key_index,
                            status = classified.status,
                            error = %error
                        );
                        self.settle_ctx(&trace_id, &candidate, key, &route, &token, started_at, None)
                            .log_only(classified.status, &error.to_string())
                            .await;
                        if classified.status == 499 {
                            // Broken pipe: the client went away mid-write.
                            return error_response(499, "client connection closed");
                        }
                        last_failure =
                            Some((classified.status, Bytes::from(error.to_string())));
                        let action = self
                            .cooldowns
                            .handle_error(
                                candidate.channel.id,
                                key.key_index,
                                classified.status,
                                b"",
                                true,
                                None,
                            )
                            .await;
                        match action {
                            Action::RetryKey => continue,
                            Action::RetryChannel => continue 'channels,
                            Action::ReturnToClient => {
                                return error_response(
                                    client_status_for(classified.status),
                                    &error.to_string(),
                                );
                            }
                        }
                    }
                    Ok(response) if !(200..300).contains(&response.status) => {
                        let body = match response.body {
                            UpstreamBody::Bytes(body) => body,
                            UpstreamBody::Stream(_) => Bytes::new(),
                        };
                        let header_map = headers_to_map(&response.headers);
                        warn!(
                            event = "upstream_attempt_failed",
                            trace_id = %trace_id,
                            channel_id = candidate.channel.id,
                            key_index = key.key_index,
                            status = response.status
                        );
                        self.settle_ctx(
                            &trace_id,
                            &candidate,
                            key,
                            &route,
                            &token,
                            started_at,
                            Some(first_byte_s),
                        )
                        .log_only(response.status, &truncate_lossy(&body, 256))
                        .await;
                        last_failure = Some((response.status, body.clone()));
                        let action = self
                            .cooldowns
                            .handle_error(
                                candidate.channel.id,
                                key.key_index,
                                response.status,
                                &body,
                                false,
                                Some(&header_map),
                            )
                            .await;
                        match action {
                            Action::RetryKey => continue,
                            Action::RetryChannel => continue 'channels,
                            Action::ReturnToClient => {
                                return passthrough_response(
                                    client_status_for(response.status),
                                    response.headers,
                                    body,
                                );
                            }
                        }
                    }
                    Ok(response) => {
                        let settle = self.settle_ctx(
                            &trace_id,
                            &candidate,
                            key,
                            &route,
                            &token,
                            started_at,
                            Some(first_byte_s),
                        );
                        match response.body {
                            UpstreamBody::Bytes(body) => {
                                let usage = extract_usage_from_json(&body).unwrap_or_default();
                                settle.success(response.status, usage).await;
                                return passthrough_response(
                                    response.status,
                                    response.headers,
                                    body,
                                );
                            }
                            UpstreamBody::Stream(upstream_rx) => {
                                match begin_stream(
                                    settle.clone(),
                                    response.status,
                                    response.headers,
                                    upstream_rx,
                                )
                                .await
                                {
                                    StreamStart::Committed(response) => return response,
                                    StreamStart::Failed { status, body } => {
                                        settle
                                            .log_only(status, &truncate_lossy(&body, 256))
                                            .await;
                                        last_failure = Some((status, body.clone()));
                                        let action = self
                                            .cooldowns
                                            .handle_error(
                                                candidate.channel.id,
                                                key.key_index,
                                                status,
                                                &body,
                                                false,
                                                None,
                                            )
                                            .await;
                                        match action {
                                            Action::RetryKey => continue,
                                            Action::RetryChannel => continue 'channels,
                                            Action::ReturnToClient => {
                                                return passthrough_response(
                                                    client_status_for(status),
                                                    Vec::new(),
                                                    body,
                                                );
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        let message = match &last_failure {
            Some((status, body)) => format!(
                "all channels exhausted; last error {status}: {}",
                truncate_lossy(body, 256)
            ),
            None => "no available channel for model".to_string(),
        };
        error_response(502, &message)
    }

    /// One upstream call, capped by the remaining request deadline.
    async fn attempt(
        &self,
        prepared: PreparedRequest,
        deadline: Instant,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.client.send(prepared)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(UpstreamError::DeadlineExceeded),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_ctx(
        &self,
        trace_id: &str,
        candidate: &ChannelCandidate,
        key: &ApiKey,
        route: &Route,
        token: &AuthToken,
        started_at: Instant,
        first_byte_s: Option<f64>,
    ) -> SettleCtx {
        SettleCtx {
            store: self.store.clone(),
            cooldowns: self.cooldowns.clone(),
            trace_id: trace_id.to_string(),
            channel: candidate.channel.clone(),
            key: key.clone(),
            requested_model: route.model.clone(),
            billing_model: candidate
                .outgoing_model
                .clone()
                .unwrap_or_else(|| route.model.clone()),
            token_id: token.id,
            is_stream: route.is_stream,
            started_at,
            first_byte_s,
        }
    }
}

/// Everything the post-attempt bookkeeping needs, owned so the streaming
/// pump can carry it into its task.
#[derive(Clone)]
struct SettleCtx {
    store: Arc<dyn Store>,
    cooldowns: CooldownManager,
    trace_id: String,
    channel: Channel,
    key: ApiKey,
    requested_model: String,
    billing_model: String,
    token_id: i64,
    is_stream: bool,
    started_at: Instant,
    first_byte_s: Option<f64>,
}

impl SettleCtx {
    fn entry(&self, status: u16, usage: StreamUsage, message: String) -> LogEntry {
        LogEntry {
            time: JsonTime::now(),
            channel_id: Some(self.channel.id),
            model: self.requested_model.clone(),
            status_code: i32::from(status),
            duration_s: self.started_at.elapsed().as_secs_f64(),
            is_streaming: self.is_stream,
            first_byte_time_s: self.first_byte_s,
            api_key_masked: mask_api_key(&self.key.api_key),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            message,
        }
    }

    async fn insert(&self, entry: LogEntry) {
        if let Err(err) = self.store.add_log(entry).await {
            warn!(trace_id = %self.trace_id, error = %err, "request log insert failed");
        }
    }

    async fn log_only(&self, status: u16, message: &str) {
        self.insert(self.entry(status, StreamUsage::default(), message.to_string()))
            .await;
    }

    /// Success bookkeeping: cost, token accumulator, log, cooldown clears.
    async fn success(&self, status: u16, usage: StreamUsage) {
        let breakdown = pricing::calculate_cost_detailed(
            &self.billing_model,
            usage.input_tokens,
            usage.output_tokens,
            usage.cache_read_tokens,
            usage.cache_5m_write_tokens,
            usage.cache_1h_write_tokens,
        );
        let micro = usd_to_micro_usd(breakdown.total_usd);
        if micro > 0
            && let Err(err) = self.store.add_token_cost(self.token_id, micro).await
        {
            warn!(
                trace_id = %self.trace_id,
                token_id = self.token_id,
                error = %err,
                "token cost accumulation failed"
            );
        }

        info!(
            event = "dispatch_done",
            trace_id = %self.trace_id,
            channel_id = self.channel.id,
            key_index = self.key.key_index,
            status = status,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = breakdown.total_usd
        );

        self.insert(self.entry(status, usage, format!("cost_usd={:.6}", breakdown.total_usd)))
            .await;
        self.cooldowns.clear_on_success(&self.channel, &self.key).await;
    }
}

enum StreamStart {
    Committed(ProxyResponse),
    Failed { status: u16, body: Bytes },
}

/// Peeks the head of the stream so an immediate SSE `error` frame can still
/// fail over to another candidate; once a clean frame arrives the response
/// is committed and the tee runs to completion in a background task.
async fn begin_stream(
    settle: SettleCtx,
    status: u16,
    headers: Vec<(String, String)>,
    mut upstream_rx: mpsc::Receiver<Bytes>,
) -> StreamStart {
    let mut parser = SseParser::new();
    let mut collector = UsageCollector::new();
    let mut pending: Vec<Bytes> = Vec::new();
    let mut upstream_done = false;

    loop {
        match upstream_rx.recv().await {
            Some(chunk) => {
                let events = parser.push(&chunk);
                pending.push(chunk);
                for event in &events {
                    collector.observe(event);
                }
                if let Some(failed) = stream_error(&collector) {
                    return failed;
                }
                if !events.is_empty() {
                    break;
                }
            }
            None => {
                for event in parser.finish() {
                    collector.observe(&event);
                }
                if let Some(failed) = stream_error(&collector) {
                    return failed;
                }
                if collector.usage().is_none() {
                    return StreamStart::Failed {
                        status: classify::STATUS_STREAM_NO_USAGE,
                        body: Bytes::from_static(b"stream ended without usage"),
                    };
                }
                upstream_done = true;
                break;
            }
        }
    }

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut client_gone = false;
        for chunk in pending {
            if tx.send(chunk).await.is_err() {
                client_gone = true;
                break;
            }
        }
        if !client_gone && !upstream_done {
            while let Some(chunk) = upstream_rx.recv().await {
                for event in parser.push(&chunk) {
                    collector.observe(&event);
                }
                if tx.send(chunk).await.is_err() {
                    client_gone = true;
                    break;
                }
                if collector.error_data().is_some() {
                    break;
                }
            }
            for event in parser.finish() {
                collector.observe(&event);
            }
        }
        drop(tx);
        settle_stream(settle, collector, client_gone).await;
    });

    StreamStart::Committed(ProxyResponse::Stream {
        status,
        headers,
        body: rx,
    })
}

fn stream_error(collector: &UsageCollector) -> Option<StreamStart> {
    let error_data = collector.error_data()?;
    let status = if is_quota_1308(error_data.as_bytes()) {
        classify::STATUS_QUOTA_IN_STREAM
    } else {
        classify::STATUS_SSE_ERROR
    };
    Some(StreamStart::Failed {
        status,
        body: Bytes::from(error_data.to_owned()),
    })
}

/// End-of-stream bookkeeping for a committed stream. The client already has
/// bytes, so failures here are recorded (and cooldowns applied) but never
/// retried.
async fn settle_stream(settle: SettleCtx, collector: UsageCollector, client_gone: bool) {
    if client_gone {
        settle.log_only(499, "client canceled mid-stream").await;
        return;
    }

    if let Some(error_data) = collector.error_data() {
        let status = if is_quota_1308(error_data.as_bytes()) {
            classify::STATUS_QUOTA_IN_STREAM
        } else {
            classify::STATUS_SSE_ERROR
        };
        let body = error_data.as_bytes().to_vec();
        settle
            .cooldowns
            .handle_error(
                settle.channel.id,
                settle.key.key_index,
                status,
                &body,
                false,
                None,
            )
            .await;
        settle.log_only(status, &truncate_lossy(&body, 256)).await;
        return;
    }

    match collector.usage() {
        Some(usage) => settle.success(200, usage).await,
        None => {
            settle
                .cooldowns
                .handle_error(
                    settle.channel.id,
                    settle.key.key_index,
                    classify::STATUS_STREAM_NO_USAGE,
                    b"",
                    false,
                    None,
                )
                .await;
            settle
                .log_only(
                    classify::STATUS_STREAM_NO_USAGE,
                    "stream ended without usage",
                )
                .await;
        }
    }
}

fn error_response(status: u16, message: &str) -> ProxyResponse {
    let body = serde_json::json!({ "error": { "message": message } });
    ProxyResponse::Full {
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
    }
}

fn passthrough_response(
    status: u16,
    headers: Vec<(String, String)>,
    body: Bytes,
) -> ProxyResponse {
    ProxyResponse::Full {
        status,
        headers,
        body,
    }
}

fn truncate_lossy(body: &[u8], cap: usize) -> String {
    String::from_utf8_lossy(&body[..body.len().min(cap)]).into_owned()
}
