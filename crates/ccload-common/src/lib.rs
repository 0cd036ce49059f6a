pub mod cooldown;
pub mod jsontime;
pub mod mask;
pub mod model;
pub mod money;

pub use cooldown::{CooldownSettings, next_cooldown};
pub use jsontime::JsonTime;
pub use mask::{hash_token, mask_api_key};
pub use model::{
    ApiKey, AuthToken, Channel, ChannelType, KeyStrategy, LogEntry, ModelConfigError, ModelEntry,
    validate_models,
};
pub use money::{micro_usd_to_usd, usd_to_micro_usd};
