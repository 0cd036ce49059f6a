pub mod auth;
pub mod classify;
pub mod config_cache;
pub mod cooldown;
pub mod engine;
pub mod pricing;
pub mod ratelimit;
pub mod select;
pub mod upstream;

pub use auth::{AuthFailure, AuthGate};
pub use classify::{Classification, ErrorLevel, classify_http_status, client_status_for};
pub use config_cache::{CachedConfigs, ConfigGetter};
pub use cooldown::{Action, CooldownManager};
pub use engine::{EngineConfig, ProxyEngine, ProxyRequest, ProxyResponse};
pub use ratelimit::LoginRateLimiter;
pub use upstream::{UpstreamClient, UpstreamClientConfig, UpstreamError, WreqUpstreamClient};
