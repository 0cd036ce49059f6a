use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Unix seconds.
    pub at: i64,
    pub channel_id: Option<i64>,
    pub model: String,
    pub status_code: i32,
    pub duration_s: f64,
    pub is_streaming: bool,
    pub first_byte_time_s: Option<f64>,
    pub api_key_masked: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub message: String,
}

impl ActiveModelBehavior for ActiveModel {}
