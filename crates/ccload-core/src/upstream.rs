//! One upstream attempt: builds the vendor-specific request for a
//! `(channel, key)` pair and executes it with a first-byte timeout that is
//! independent of the per-request deadline.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Method};

use ccload_common::{ApiKey, Channel, ChannelType};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_BETA: &str =
    "interleaved-thinking-2025-05-14,advanced-tool-use-2025-11-20";

/// Transport-level failures. `FirstByteTimeout` is a sentinel the classifier
/// matches structurally; it must never be collapsed into a string.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream first byte timeout")]
    FirstByteTimeout,
    #[error("client canceled")]
    Canceled,
    #[error("request deadline exceeded")]
    DeadlineExceeded,
    #[error("upstream timeout: {0}")]
    Timeout(String),
    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub is_stream: bool,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

/// Builds the outgoing request for one candidate. `outgoing_model` is the
/// redirect target when the matched model entry carries one; the body's
/// `model` field (or the Gemini path segment) is rewritten to it.
pub fn build_attempt(
    channel: &Channel,
    key: &ApiKey,
    path: &str,
    query: Option<&str>,
    outgoing_model: Option<&str>,
    body: &Bytes,
    is_stream: bool,
) -> PreparedRequest {
    let base = channel.base_url.trim_end_matches('/');
    let mut headers: Vec<(String, String)> = vec![
        ("content-type".to_string(), "application/json".to_string()),
    ];
    if is_stream {
        headers.push(("accept".to_string(), "text/event-stream".to_string()));
    }

    let url;
    let mut out_body = body.clone();
    match channel.channel_type {
        ChannelType::Anthropic => {
            url = if path.starts_with("/v1/messages/count_tokens") {
                format!("{base}/v1/messages/count_tokens")
            } else {
                format!("{base}/v1/messages?beta=true")
            };
            headers.push((
                "authorization".to_string(),
                format!("Bearer {}", key.api_key),
            ));
            headers.push(("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()));
            headers.push(("anthropic-beta".to_string(), ANTHROPIC_BETA.to_string()));
            if let Some(model) = outgoing_model {
                out_body = rewrite_model_in_body(body, model);
            }
        }
        ChannelType::Openai => {
            url = match query {
                Some(query) if !query.is_empty() => format!("{base}{path}?{query}"),
                _ => format!("{base}{path}"),
            };
            headers.push((
                "authorization".to_string(),
                format!("Bearer {}", key.api_key),
            ));
            if let Some(model) = outgoing_model {
                out_body = rewrite_model_in_body(body, model);
            }
        }
        ChannelType::Codex => {
            url = format!("{base}/v1/responses");
            headers.push((
                "authorization".to_string(),
                format!("Bearer {}", key.api_key),
            ));
            headers.push((
                "openai-beta".to_string(),
                "responses=experimental".to_string(),
            ));
            if let Some(model) = outgoing_model {
                out_body = rewrite_model_in_body(body, model);
            }
        }
        ChannelType::Gemini => {
            let path = match outgoing_model {
                Some(model) => rewrite_gemini_path(path, model),
                None => path.to_string(),
            };
            let query = gemini_query(query, is_stream);
            url = match query {
                Some(query) => format!("{base}{path}?{query}"),
                None => format!("{base}{path}"),
            };
            headers.push(("x-goog-api-key".to_string(), key.api_key.clone()));
        }
    }

    PreparedRequest {
        url,
        headers,
        body: out_body,
        is_stream,
    }
}

fn rewrite_model_in_body(body: &Bytes, model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.clone();
    };
    let Some(object) = value.as_object_mut() else {
        return body.clone();
    };
    object.insert(
        "model".to_string(),
        serde_json::Value::String(model.to_string()),
    );
    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

/// Replaces the model segment of `/v1beta/models/{model}:{action}`.
fn rewrite_gemini_path(path: &str, model: &str) -> String {
    const MARKER: &str = "/models/";
    let Some(start) = path.find(MARKER) else {
        return path.to_string();
    };
    let segment_start = start + MARKER.len();
    let rest = &path[segment_start..];
    let segment_end = rest.find(':').map_or(path.len(), |at| segment_start + at);
    format!("{}{}{}", &path[..segment_start], model, &path[segment_end..])
}

fn gemini_query(query: Option<&str>, is_stream: bool) -> Option<String> {
    let query = query.unwrap_or("").to_string();
    if is_stream && !query.split('&').any(|pair| pair == "alt=sse") {
        let query = if query.is_empty() {
            "alt=sse".to_string()
        } else {
            format!("{query}&alt=sse")
        };
        return Some(query);
    }
    (!query.is_empty()).then_some(query)
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: PreparedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    /// Window from request send to the first response byte.
    pub first_byte_timeout: Duration,
    pub stream_idle_timeout: Duration,
    /// Outer cap on a single upstream exchange; effectively unbounded so
    /// long streams are governed by the idle timeout instead.
    pub request_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            first_byte_timeout: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(86400),
        }
    }
}

#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .build()
            .map_err(|err| UpstreamError::Transport(err.to_string()))?;
        Ok(Self { config, client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: PreparedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self.client.request(Method::POST, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            builder = builder.body(req.body.clone());

            // wreq resolves `send` once response headers arrive, so a
            // timeout around it is exactly the first-byte window.
            let response =
                match tokio::time::timeout(self.config.first_byte_timeout, builder.send()).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(err)) => return Err(map_wreq_error(&err)),
                    Err(_) => return Err(UpstreamError::FirstByteTimeout),
                };
            convert_response(response, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

fn map_wreq_error(err: &wreq::Error) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::Timeout(err.to_string());
    }
    UpstreamError::Transport(err.to_string())
}

async fn convert_response(
    response: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamResponse, UpstreamError> {
    let status = response.status().as_u16();
    let headers = headers_from_wreq(response.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = response
            .bytes()
            .await
            .map_err(|err| map_wreq_error(&err))?;
        if is_success && body.is_empty() {
            return Err(UpstreamError::Transport(
                "empty response from upstream (Content-Length: 0)".to_string(),
            ));
        }
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => break,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

/// Converts boundary headers into an `http::HeaderMap` for the classifier.
pub fn headers_to_map(headers: &[(String, String)]) -> http::HeaderMap {
    let mut map = http::HeaderMap::new();
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
