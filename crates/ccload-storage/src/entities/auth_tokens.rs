use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "auth_tokens")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// SHA-256 of the plaintext token; the plaintext is never stored.
    #[sea_orm(unique_key = "auth_token_hash")]
    pub token_hash: String,
    pub description: String,
    /// Unix milliseconds.
    pub expires_at_ms: Option<i64>,
    pub last_used_at_ms: Option<i64>,
    pub is_active: bool,
    pub allowed_models: Json,
    pub cost_used_micro_usd: i64,
    pub cost_limit_micro_usd: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
