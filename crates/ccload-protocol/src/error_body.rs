//! Upstream error-body parsing, including the vendor quota error `1308`
//! whose message advertises a precise reset timestamp.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

const QUOTA_ERROR_CODE: &str = "1308";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamErrorInfo {
    /// `error.type` when present, else `error.code` (numbers stringified).
    pub kind: Option<String>,
    pub message: Option<String>,
}

/// Parses the `{"error": {...}}` envelope shared by the supported vendors.
/// Also accepts SSE error-event payloads (`{"type":"error","error":{...}}`).
pub fn parse_error_info(body: &[u8]) -> Option<UpstreamErrorInfo> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let error = value.get("error")?;
    Some(UpstreamErrorInfo {
        kind: error_kind(error).or_else(|| top_level_kind(&value)),
        message: error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn error_kind(error: &Value) -> Option<String> {
    if let Some(kind) = error.get("type").and_then(Value::as_str) {
        return Some(kind.to_string());
    }
    match error.get("code") {
        Some(Value::String(code)) => Some(code.clone()),
        Some(Value::Number(code)) => Some(code.to_string()),
        _ => None,
    }
}

fn top_level_kind(value: &Value) -> Option<String> {
    match value.get("type").and_then(Value::as_str) {
        Some("error") | None => None,
        Some(kind) => Some(kind.to_string()),
    }
}

/// Whether the body carries the vendor quota-exhausted error, regardless of
/// the surrounding HTTP status.
pub fn is_quota_1308(body: &[u8]) -> bool {
    parse_error_info(body)
        .and_then(|info| info.kind)
        .is_some_and(|kind| kind == QUOTA_ERROR_CODE)
}

/// Extracts the advertised reset instant from a `1308` error message: the
/// first `YYYY-MM-DD HH:MM:SS` substring, interpreted in the local timezone
/// (UTC when the local offset cannot be determined).
pub fn parse_quota_reset_time(body: &[u8]) -> Option<OffsetDateTime> {
    let info = parse_error_info(body)?;
    if info.kind.as_deref() != Some(QUOTA_ERROR_CODE) {
        return None;
    }
    let message = info.message?;
    let matched = reset_time_pattern().find(&message)?;
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let parsed = PrimitiveDateTime::parse(matched.as_str(), &format).ok()?;
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    Some(parsed.assume_offset(offset))
}

fn reset_time_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}").unwrap()
    })
}
