pub mod api_keys;
pub mod auth_tokens;
pub mod channels;
pub mod request_logs;

pub use api_keys::Entity as ApiKeys;
pub use auth_tokens::Entity as AuthTokens;
pub use channels::Entity as Channels;
pub use request_logs::Entity as RequestLogs;
