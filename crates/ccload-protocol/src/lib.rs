pub mod error_body;
pub mod sse;
pub mod usage;

pub use error_body::{UpstreamErrorInfo, is_quota_1308, parse_error_info, parse_quota_reset_time};
pub use sse::{SseEvent, SseParser};
pub use usage::{StreamUsage, UsageCollector, extract_usage_from_json};
