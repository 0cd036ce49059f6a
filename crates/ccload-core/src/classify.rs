//! Error classification: maps transport failures, HTTP responses, and SSE
//! error frames onto a three-level taxonomy. Key-level faults cool one
//! credential, channel-level faults cool the whole endpoint, client-level
//! faults go straight back to the caller.
//!
//! The status table here is the single source of truth; callers consult the
//! returned level and never re-derive it.

use http::HeaderMap;

use crate::upstream::UpstreamError;

/// Quota error (code 1308) observed inside an otherwise successful stream.
pub const STATUS_QUOTA_IN_STREAM: u16 = 596;
/// SSE `error` event observed on the stream.
pub const STATUS_SSE_ERROR: u16 = 597;
/// No byte arrived from the upstream within the first-byte window.
pub const STATUS_FIRST_BYTE_TIMEOUT: u16 = 598;
/// Stream ended without ever carrying a usage frame.
pub const STATUS_STREAM_NO_USAGE: u16 = 599;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    None,
    Key,
    Channel,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: u16,
    pub level: ErrorLevel,
    pub retry: bool,
}

impl Classification {
    fn new(status: u16, level: ErrorLevel, retry: bool) -> Self {
        Self {
            status,
            level,
            retry,
        }
    }
}

/// Status-only classification.
pub fn classify_http_status(status: u16) -> Classification {
    let (level, retry) = match status {
        200..=299 => (ErrorLevel::None, false),
        401 | 402 | 403 | 429 => (ErrorLevel::Key, true),
        STATUS_QUOTA_IN_STREAM | STATUS_SSE_ERROR => (ErrorLevel::Key, true),
        STATUS_FIRST_BYTE_TIMEOUT | STATUS_STREAM_NO_USAGE => (ErrorLevel::Channel, true),
        // Upstreams that answer 405 have their base URL pointed somewhere
        // that does not serve the API path.
        405 => (ErrorLevel::Channel, true),
        // 499 in an upstream response is its own client-abort relay, not our
        // cancellation; the endpoint is misbehaving.
        499 => (ErrorLevel::Channel, true),
        406 | 408 | 410 | 413..=417 => (ErrorLevel::Client, false),
        400 | 404 => (ErrorLevel::Client, false),
        500..=595 => (ErrorLevel::Channel, true),
        _ if (400..500).contains(&status) => (ErrorLevel::Client, false),
        _ => (ErrorLevel::Channel, true),
    };
    Classification::new(status, level, retry)
}

/// Body- and header-aware classification of an upstream HTTP response.
pub fn classify_http_response(
    status: u16,
    headers: Option<&HeaderMap>,
    body: &[u8],
) -> Classification {
    match status {
        400 => classify_bad_request(body),
        404 => classify_not_found(headers, body),
        429 => {
            let level = match headers {
                Some(headers) => classify_rate_limit(headers, body),
                None => ErrorLevel::Key,
            };
            Classification::new(429, level, true)
        }
        STATUS_SSE_ERROR => classify_sse_error(body),
        _ => classify_http_status(status),
    }
}

/// 400: a key-side rejection when the body blames the credential, otherwise
/// the caller's request is defective.
fn classify_bad_request(body: &[u8]) -> Classification {
    let lowered = lossy_lowercase(body);
    if lowered.contains("invalid_api_key") || lowered.contains("api key") {
        Classification::new(400, ErrorLevel::Key, true)
    } else {
        Classification::new(400, ErrorLevel::Client, false)
    }
}

/// 404: an HTML body means the base URL points at something that is not the
/// API (channel fault); a JSON `model_not_found` is the caller's mistake.
fn classify_not_found(headers: Option<&HeaderMap>, body: &[u8]) -> Classification {
    if looks_like_html(headers, body) {
        return Classification::new(404, ErrorLevel::Channel, true);
    }
    Classification::new(404, ErrorLevel::Client, false)
}

fn looks_like_html(headers: Option<&HeaderMap>, body: &[u8]) -> bool {
    if let Some(headers) = headers
        && let Some(content_type) = headers.get(http::header::CONTENT_TYPE)
        && let Ok(value) = content_type.to_str()
        && value.to_ascii_lowercase().contains("text/html")
    {
        return true;
    }
    let trimmed = lossy_lowercase(body);
    let trimmed = trimmed.trim_start();
    trimmed.starts_with("<!doctype") || trimmed.starts_with("<html")
}

/// 429 sub-classification: long or account-wide limits cool the channel,
/// everything else stays on the key.
pub fn classify_rate_limit(headers: &HeaderMap, body: &[u8]) -> ErrorLevel {
    if let Some(value) = header_str(headers, "retry-after") {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            if seconds > 60 {
                return ErrorLevel::Channel;
            }
        } else if httpdate::parse_http_date(value).is_ok() {
            return ErrorLevel::Channel;
        }
    }

    if let Some(scope) = header_str(headers, "x-ratelimit-scope") {
        let scope = scope.trim().to_ascii_lowercase();
        if matches!(scope.as_str(), "global" | "ip" | "account") {
            return ErrorLevel::Channel;
        }
    }

    let lowered = lossy_lowercase(body);
    const CHANNEL_MARKERS: [&str; 4] = [
        "ip rate limit",
        "account rate limit",
        "global rate limit",
        "organization limit",
    ];
    if CHANNEL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return ErrorLevel::Channel;
    }

    ErrorLevel::Key
}

/// Classification of an SSE `error` event payload (internal status 597).
/// The error kind is `error.type`, falling back to `error.code`; unknown or
/// unparseable kinds stay key-level.
pub fn classify_sse_error(body: &[u8]) -> Classification {
    let kind = ccload_protocol::parse_error_info(body).and_then(|info| info.kind);
    let level = match kind.as_deref() {
        Some("api_error") | Some("overloaded_error") => ErrorLevel::Channel,
        _ => ErrorLevel::Key,
    };
    Classification::new(STATUS_SSE_ERROR, level, true)
}

/// Classification of transport-level failures raised by the upstream client.
pub fn classify_transport(error: &UpstreamError) -> Classification {
    match error {
        UpstreamError::FirstByteTimeout => {
            Classification::new(STATUS_FIRST_BYTE_TIMEOUT, ErrorLevel::Channel, true)
        }
        UpstreamError::Canceled => Classification::new(499, ErrorLevel::Client, false),
        UpstreamError::DeadlineExceeded => Classification::new(504, ErrorLevel::Channel, true),
        UpstreamError::Timeout(_) => Classification::new(504, ErrorLevel::Channel, true),
        UpstreamError::Transport(message) => classify_transport_message(message),
    }
}

fn classify_transport_message(message: &str) -> Classification {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("broken pipe") {
        return Classification::new(499, ErrorLevel::Client, false);
    }
    // Peer/connection failures, HTTP/2 stream teardown, and the empty
    // response marker all map to a retryable 502, which is also the
    // fallback for anything unrecognized.
    Classification::new(502, ErrorLevel::Channel, true)
}

/// Maps internal statuses to what the client sees. Real upstream statuses
/// pass through untouched (transparent-proxy principle).
pub fn client_status_for(status: u16) -> u16 {
    match status {
        0 => 502,
        STATUS_QUOTA_IN_STREAM => 429,
        STATUS_SSE_ERROR | STATUS_STREAM_NO_USAGE => 502,
        STATUS_FIRST_BYTE_TIMEOUT => 504,
        _ => status,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn lossy_lowercase(body: &[u8]) -> String {
    String::from_utf8_lossy(body).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn status_table_matches_taxonomy() {
        let cases: &[(u16, ErrorLevel, bool)] = &[
            (200, ErrorLevel::None, false),
            (204, ErrorLevel::None, false),
            (401, ErrorLevel::Key, true),
            (402, ErrorLevel::Key, true),
            (403, ErrorLevel::Key, true),
            (429, ErrorLevel::Key, true),
            (499, ErrorLevel::Channel, true),
            (500, ErrorLevel::Channel, true),
            (502, ErrorLevel::Channel, true),
            (503, ErrorLevel::Channel, true),
            (504, ErrorLevel::Channel, true),
            (520, ErrorLevel::Channel, true),
            (521, ErrorLevel::Channel, true),
            (524, ErrorLevel::Channel, true),
            (405, ErrorLevel::Channel, true),
            (406, ErrorLevel::Client, false),
            (408, ErrorLevel::Client, false),
            (410, ErrorLevel::Client, false),
            (413, ErrorLevel::Client, false),
            (414, ErrorLevel::Client, false),
            (415, ErrorLevel::Client, false),
            (416, ErrorLevel::Client, false),
            (417, ErrorLevel::Client, false),
            (404, ErrorLevel::Client, false),
            (400, ErrorLevel::Client, false),
            (596, ErrorLevel::Key, true),
            (597, ErrorLevel::Key, true),
            (598, ErrorLevel::Channel, true),
            (599, ErrorLevel::Channel, true),
        ];
        for (status, level, retry) in cases {
            let classified = classify_http_status(*status);
            assert_eq!(classified.level, *level, "status {status}");
            assert_eq!(classified.retry, *retry, "status {status}");
        }
    }

    #[test]
    fn bad_request_body_blaming_the_key_is_key_level() {
        let classified = classify_http_response(
            400,
            None,
            br#"{"error":{"type":"invalid_request_error","message":"Invalid_API_Key provided"}}"#,
        );
        assert_eq!(classified.level, ErrorLevel::Key);
        assert!(classified.retry);

        let classified = classify_http_response(400, None, br#"{"error":"bad api key"}"#);
        assert_eq!(classified.level, ErrorLevel::Key);

        let classified =
            classify_http_response(400, None, br#"{"error":{"message":"missing field"}}"#);
        assert_eq!(classified.level, ErrorLevel::Client);
        assert!(!classified.retry);
    }

    #[test]
    fn not_found_html_body_is_a_channel_fault() {
        let classified =
            classify_http_response(404, None, b"<!DOCTYPE html><html><body>nginx</body></html>");
        assert_eq!(classified.level, ErrorLevel::Channel);
        assert!(classified.retry);

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        let classified = classify_http_response(404, Some(&headers), b"gateway");
        assert_eq!(classified.level, ErrorLevel::Channel);
    }

    #[test]
    fn not_found_json_model_error_stays_client() {
        let classified = classify_http_response(
            404,
            None,
            br#"{"error":{"type":"model_not_found","message":"no such model"}}"#,
        );
        assert_eq!(classified.level, ErrorLevel::Client);
        assert!(!classified.retry);

        let classified = classify_http_response(404, None, b"");
        assert_eq!(classified.level, ErrorLevel::Client);
    }

    #[test]
    fn rate_limit_long_retry_after_is_channel_level() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(
            classify_rate_limit(&headers, b"{}"),
            ErrorLevel::Channel
        );

        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("30"));
        assert_eq!(classify_rate_limit(&headers, b"{}"), ErrorLevel::Key);

        let mut headers = HeaderMap::new();
        headers.insert(
            "retry-after",
            HeaderValue::from_static("Tue, 09 Dec 2025 18:08:11 GMT"),
        );
        assert_eq!(classify_rate_limit(&headers, b"{}"), ErrorLevel::Channel);
    }

    #[test]
    fn rate_limit_scope_header_and_body_markers() {
        for scope in ["global", "IP", "Account"] {
            let mut headers = HeaderMap::new();
            headers.insert("x-ratelimit-scope", HeaderValue::from_str(scope).unwrap());
            assert_eq!(
                classify_rate_limit(&headers, b"{}"),
                ErrorLevel::Channel,
                "scope {scope}"
            );
        }

        let headers = HeaderMap::new();
        assert_eq!(
            classify_rate_limit(&headers, b"{\"error\":\"Account Rate Limit reached\"}"),
            ErrorLevel::Channel
        );
        assert_eq!(
            classify_rate_limit(&headers, b"{\"error\":\"organization limit hit\"}"),
            ErrorLevel::Channel
        );
        assert_eq!(
            classify_rate_limit(&headers, b"{\"error\":\"rate limit\"}"),
            ErrorLevel::Key
        );
    }

    #[test]
    fn sse_error_kinds_split_key_and_channel() {
        let channel_kinds = [
            br#"{"type":"error","error":{"type":"api_error"}}"#.as_slice(),
            br#"{"type":"error","error":{"type":"overloaded_error"}}"#.as_slice(),
        ];
        for body in channel_kinds {
            assert_eq!(classify_sse_error(body).level, ErrorLevel::Channel);
        }

        let key_kinds = [
            br#"{"type":"error","error":{"type":"rate_limit_error"}}"#.as_slice(),
            br#"{"type":"error","error":{"type":"authentication_error"}}"#.as_slice(),
            br#"{"type":"error","error":{"type":"invalid_request_error"}}"#.as_slice(),
            br#"{"type":"error","error":{"type":"1308","message":"quota"}}"#.as_slice(),
            br#"{"type":"error","error":{"code":"1308"}}"#.as_slice(),
            b"not json".as_slice(),
            br#"{"type":"error","error":{"type":"something_new"}}"#.as_slice(),
        ];
        for body in key_kinds {
            let classified = classify_sse_error(body);
            assert_eq!(classified.level, ErrorLevel::Key);
            assert_eq!(classified.status, STATUS_SSE_ERROR);
            assert!(classified.retry);
        }
    }

    #[test]
    fn transport_errors_follow_the_table() {
        let cases: &[(UpstreamError, u16, ErrorLevel, bool)] = &[
            (UpstreamError::FirstByteTimeout, 598, ErrorLevel::Channel, true),
            (UpstreamError::Canceled, 499, ErrorLevel::Client, false),
            (UpstreamError::DeadlineExceeded, 504, ErrorLevel::Channel, true),
            (
                UpstreamError::Timeout("operation timed out".to_string()),
                504,
                ErrorLevel::Channel,
                true,
            ),
            (
                UpstreamError::Transport("write: Broken pipe".to_string()),
                499,
                ErrorLevel::Client,
                false,
            ),
            (
                UpstreamError::Transport("connection reset by peer".to_string()),
                502,
                ErrorLevel::Channel,
                true,
            ),
            (
                UpstreamError::Transport("dns: no such host".to_string()),
                502,
                ErrorLevel::Channel,
                true,
            ),
            (
                UpstreamError::Transport("http2: stream error: PROTOCOL_ERROR".to_string()),
                502,
                ErrorLevel::Channel,
                true,
            ),
            (
                UpstreamError::Transport(
                    "empty response from upstream (Content-Length: 0)".to_string(),
                ),
                502,
                ErrorLevel::Channel,
                true,
            ),
            (
                UpstreamError::Transport("some novel failure".to_string()),
                502,
                ErrorLevel::Channel,
                true,
            ),
        ];
        for (error, status, level, retry) in cases {
            let classified = classify_transport(error);
            assert_eq!(classified.status, *status, "{error}");
            assert_eq!(classified.level, *level, "{error}");
            assert_eq!(classified.retry, *retry, "{error}");
        }
    }

    #[test]
    fn client_status_mapping() {
        assert_eq!(client_status_for(596), 429);
        assert_eq!(client_status_for(597), 502);
        assert_eq!(client_status_for(598), 504);
        assert_eq!(client_status_for(599), 502);
        assert_eq!(client_status_for(0), 502);
        // Transparent passthrough for real statuses.
        for status in [401, 403, 404, 405, 429, 500, 503] {
            assert_eq!(client_status_for(status), status);
        }
    }
}
