use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "channel_name")]
    pub name: String,
    pub channel_type: String,
    pub base_url: String,
    pub priority: i64,
    pub enabled: bool,
    pub models: Json,
    /// Unix seconds; 0 = no cooldown.
    pub cooldown_until: i64,
    pub cooldown_duration_ms: i64,
    pub daily_cost_limit_usd: f64,
    pub key_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
