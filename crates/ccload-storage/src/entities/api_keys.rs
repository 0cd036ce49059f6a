use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub channel_id: i64,
    /// 0-based position within the channel; unique per channel.
    pub key_index: i32,
    pub api_key: String,
    pub key_strategy: String,
    pub cooldown_until: i64,
    pub cooldown_duration_ms: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "channel_id", to = "id", on_delete = "Cascade")]
    pub channel: HasOne<super::channels::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
