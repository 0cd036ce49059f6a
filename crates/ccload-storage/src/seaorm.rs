use std::collections::HashMap;
use std::time::Duration;

use sea_orm::sea_query::{Expr, Index};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Schema,
    TransactionTrait,
};
use time::OffsetDateTime;

use async_trait::async_trait;
use ccload_common::{
    ApiKey, AuthToken, Channel, ChannelType, CooldownSettings, JsonTime, KeyStrategy, LogEntry,
    ModelEntry, next_cooldown, validate_models,
};

use crate::entities;
use crate::store::{
    AuthTokenDraft, ChannelDraft, LogFilter, Store, StoreError, StoreResult,
};

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
    cooldowns: CooldownSettings,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str, cooldowns: CooldownSettings) -> StoreResult<Self> {
        let db = Database::connect(dsn).await?;
        // Sqlite needs foreign keys switched on for cascades to work.
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db, cooldowns })
    }

    /// Entity-first schema sync plus the indexes dispatch reads depend on.
    pub async fn sync(&self) -> StoreResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Channels)
            .register(entities::ApiKeys)
            .register(entities::AuthTokens)
            .register(entities::RequestLogs)
            .sync(&self.db)
            .await?;
        self.ensure_indexes().await?;
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn ensure_indexes(&self) -> StoreResult<()> {
        use entities::api_keys::Column as ApiKeyColumn;
        use entities::request_logs::Column as LogColumn;

        let statements = vec![
            Index::create()
                .name("idx_api_keys_channel_key_index")
                .table(entities::api_keys::Entity)
                .col(ApiKeyColumn::ChannelId)
                .col(ApiKeyColumn::KeyIndex)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_logs_at_id")
                .table(entities::request_logs::Entity)
                .col(LogColumn::At)
                .col(LogColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_logs_channel_at")
                .table(entities::request_logs::Entity)
                .col(LogColumn::ChannelId)
                .col(LogColumn::At)
                .if_not_exists()
                .to_owned(),
        ];
        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }

    async fn find_key_row(
        txn: &sea_orm::DatabaseTransaction,
        channel_id: i64,
        key_index: i32,
    ) -> StoreResult<entities::api_keys::Model> {
        use entities::api_keys::Column;
        entities::ApiKeys::find()
            .filter(Column::ChannelId.eq(channel_id))
            .filter(Column::KeyIndex.eq(key_index))
            .one(txn)
            .await?
            .ok_or(StoreError::NotFound("api key"))
    }

    async fn find_channel_row(
        txn: &sea_orm::DatabaseTransaction,
        channel_id: i64,
    ) -> StoreResult<entities::channels::Model> {
        entities::Channels::find_by_id(channel_id)
            .one(txn)
            .await?
            .ok_or(StoreError::NotFound("channel"))
    }
}

fn channel_from_model(model: entities::channels::Model) -> StoreResult<Channel> {
    let models: Vec<ModelEntry> = serde_json::from_value(model.models)?;
    Ok(Channel::from_parts(
        model.id,
        model.name,
        ChannelType::parse_or_default(&model.channel_type),
        model.base_url,
        model.priority,
        model.enabled,
        models,
        model.cooldown_until,
        model.cooldown_duration_ms,
        model.daily_cost_limit_usd,
        model.key_count,
    ))
}

fn api_key_from_model(model: entities::api_keys::Model) -> ApiKey {
    ApiKey {
        id: model.id,
        channel_id: model.channel_id,
        key_index: model.key_index,
        api_key: model.api_key,
        key_strategy: KeyStrategy::parse_or_default(&model.key_strategy),
        cooldown_until: model.cooldown_until,
        cooldown_duration_ms: model.cooldown_duration_ms,
    }
}

fn token_from_model(model: entities::auth_tokens::Model) -> StoreResult<AuthToken> {
    let allowed_models: Vec<String> = serde_json::from_value(model.allowed_models)?;
    Ok(AuthToken {
        id: model.id,
        token_hash: model.token_hash,
        description: model.description,
        expires_at_ms: model.expires_at_ms,
        last_used_at_ms: model.last_used_at_ms,
        is_active: model.is_active,
        allowed_models,
        cost_used_micro_usd: model.cost_used_micro_usd,
        cost_limit_micro_usd: model.cost_limit_micro_usd,
    })
}

fn log_from_model(model: entities::request_logs::Model) -> LogEntry {
    LogEntry {
        time: JsonTime::from_unix(model.at),
        channel_id: model.channel_id,
        model: model.model,
        status_code: model.status_code,
        duration_s: model.duration_s,
        is_streaming: model.is_streaming,
        first_byte_time_s: model.first_byte_time_s,
        api_key_masked: model.api_key_masked,
        input_tokens: model.input_tokens,
        output_tokens: model.output_tokens,
        cache_read_tokens: model.cache_read_tokens,
        cache_creation_tokens: model.cache_creation_tokens,
        message: model.message,
    }
}

fn set_duration_ms_for_until(until: i64) -> i64 {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    until.saturating_sub(now).max(0) * 1000
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn get_config(&self, id: i64) -> StoreResult<Channel> {
        let model = entities::Channels::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound("channel"))?;
        channel_from_model(model)
    }

    async fn list_configs(&self) -> StoreResult<Vec<Channel>> {
        use entities::channels::Column;
        let rows = entities::Channels::find()
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await?;
        rows.into_iter().map(channel_from_model).collect()
    }

    async fn create_config(&self, draft: ChannelDraft) -> StoreResult<Channel> {
        validate_models(&draft.models)?;
        let now = OffsetDateTime::now_utc();
        let inserted = entities::channels::ActiveModel {
            name: ActiveValue::Set(draft.name),
            channel_type: ActiveValue::Set(draft.channel_type.as_str().to_string()),
            base_url: ActiveValue::Set(draft.base_url),
            priority: ActiveValue::Set(draft.priority),
            enabled: ActiveValue::Set(draft.enabled),
            models: ActiveValue::Set(serde_json::to_value(&draft.models)?),
            cooldown_until: ActiveValue::Set(0),
            cooldown_duration_ms: ActiveValue::Set(0),
            daily_cost_limit_usd: ActiveValue::Set(draft.daily_cost_limit_usd),
            key_count: ActiveValue::Set(0),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        channel_from_model(inserted)
    }

    async fn update_config(&self, id: i64, draft: ChannelDraft) -> StoreResult<Channel> {
        validate_models(&draft.models)?;
        let model = entities::Channels::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StoreError::NotFound("channel"))?;
        let mut active: entities::channels::ActiveModel = model.into();
        active.name = ActiveValue::Set(draft.name);
        active.channel_type = ActiveValue::Set(draft.channel_type.as_str().to_string());
        active.base_url = ActiveValue::Set(draft.base_url);
        active.priority = ActiveValue::Set(draft.priority);
        active.enabled = ActiveValue::Set(draft.enabled);
        active.models = ActiveValue::Set(serde_json::to_value(&draft.models)?);
        active.daily_cost_limit_usd = ActiveValue::Set(draft.daily_cost_limit_usd);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        let updated = active.update(&self.db).await?;
        channel_from_model(updated)
    }

    async fn get_api_keys(&self, channel_id: i64) -> StoreResult<Vec<ApiKey>> {
        use entities::api_keys::Column;
        let rows = entities::ApiKeys::find()
            .filter(Column::ChannelId.eq(channel_id))
            .order_by_asc(Column::KeyIndex)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(api_key_from_model).collect())
    }

    async fn create_api_key(
        &self,
        channel_id: i64,
        api_key: &str,
        key_strategy: KeyStrategy,
    ) -> StoreResult<ApiKey> {
        use entities::api_keys::Column;
        let txn = self.db.begin().await?;
        let channel = Self::find_channel_row(&txn, channel_id).await?;
        let next_index = entities::ApiKeys::find()
            .filter(Column::ChannelId.eq(channel_id))
            .order_by_desc(Column::KeyIndex)
            .one(&txn)
            .await?
            .map(|row| row.key_index + 1)
            .unwrap_or(0);
        let now = OffsetDateTime::now_utc();
        let inserted = entities::api_keys::ActiveModel {
            channel_id: ActiveValue::Set(channel_id),
            key_index: ActiveValue::Set(next_index),
            api_key: ActiveValue::Set(api_key.to_string()),
            key_strategy: ActiveValue::Set(key_strategy.as_str().to_string()),
            cooldown_until: ActiveValue::Set(0),
            cooldown_duration_ms: ActiveValue::Set(0),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        // Keep the denormalized key_count in step with the key rows.
        let count = entities::ApiKeys::find()
            .filter(Column::ChannelId.eq(channel_id))
            .count(&txn)
            .await?;
        let mut channel_active: entities::channels::ActiveModel = channel.into();
        channel_active.key_count = ActiveValue::Set(count as i64);
        channel_active.updated_at = ActiveValue::Set(now);
        channel_active.update(&txn).await?;

        txn.commit().await?;
        Ok(api_key_from_model(inserted))
    }

    async fn get_all_key_cooldowns(&self) -> StoreResult<HashMap<(i64, i32), i64>> {
        let rows = entities::ApiKeys::find().all(&self.db).await?;
        Ok(rows
            .into_iter()
            .map(|row| ((row.channel_id, row.key_index), row.cooldown_until))
            .collect())
    }

    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i32,
        now: i64,
        status: u16,
    ) -> StoreResult<i64> {
        let txn = self.db.begin().await?;
        let row = Self::find_key_row(&txn, channel_id, key_index).await?;
        let prev = Duration::from_millis(row.cooldown_duration_ms.max(0) as u64);
        let next = next_cooldown(prev, row.cooldown_until, now, status, &self.cooldowns);
        let until = now + next.as_secs() as i64;
        let mut active: entities::api_keys::ActiveModel = row.into();
        active.cooldown_until = ActiveValue::Set(until);
        active.cooldown_duration_ms = ActiveValue::Set(next.as_millis() as i64);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(until)
    }

    async fn set_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i32,
        until: i64,
    ) -> StoreResult<()> {
        let txn = self.db.begin().await?;
        let row = Self::find_key_row(&txn, channel_id, key_index).await?;
        let mut active: entities::api_keys::ActiveModel = row.into();
        active.cooldown_until = ActiveValue::Set(until);
        active.cooldown_duration_ms = ActiveValue::Set(set_duration_ms_for_until(until));
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i32) -> StoreResult<()> {
        let txn = self.db.begin().await?;
        let row = Self::find_key_row(&txn, channel_id, key_index).await?;
        let mut active: entities::api_keys::ActiveModel = row.into();
        active.cooldown_until = ActiveValue::Set(0);
        active.cooldown_duration_ms = ActiveValue::Set(0);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn bump_channel_cooldown(
        &self,
        channel_id: i64,
        now: i64,
        status: u16,
    ) -> StoreResult<i64> {
        let txn = self.db.begin().await?;
        let row = Self::find_channel_row(&txn, channel_id).await?;
        let prev = Duration::from_millis(row.cooldown_duration_ms.max(0) as u64);
        let next = next_cooldown(prev, row.cooldown_until, now, status, &self.cooldowns);
        let until = now + next.as_secs() as i64;
        let mut active: entities::channels::ActiveModel = row.into();
        active.cooldown_until = ActiveValue::Set(until);
        active.cooldown_duration_ms = ActiveValue::Set(next.as_millis() as i64);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(until)
    }

    async fn set_channel_cooldown(&self, channel_id: i64, until: i64) -> StoreResult<()> {
        let txn = self.db.begin().await?;
        let row = Self::find_channel_row(&txn, channel_id).await?;
        let mut active: entities::channels::ActiveModel = row.into();
        active.cooldown_until = ActiveValue::Set(until);
        active.cooldown_duration_ms = ActiveValue::Set(set_duration_ms_for_until(until));
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn reset_channel_cooldown(&self, channel_id: i64) -> StoreResult<()> {
        let txn = self.db.begin().await?;
        let row = Self::find_channel_row(&txn, channel_id).await?;
        let mut active: entities::channels::ActiveModel = row.into();
        active.cooldown_until = ActiveValue::Set(0);
        active.cooldown_duration_ms = ActiveValue::Set(0);
        active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        active.update(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn add_log(&self, entry: LogEntry) -> StoreResult<()> {
        entities::request_logs::ActiveModel {
            at: ActiveValue::Set(entry.time.unix()),
            channel_id: ActiveValue::Set(entry.channel_id),
            model: ActiveValue::Set(entry.model),
            status_code: ActiveValue::Set(entry.status_code),
            duration_s: ActiveValue::Set(entry.duration_s),
            is_streaming: ActiveValue::Set(entry.is_streaming),
            first_byte_time_s: ActiveValue::Set(entry.first_byte_time_s),
            api_key_masked: ActiveValue::Set(entry.api_key_masked),
            input_tokens: ActiveValue::Set(entry.input_tokens),
            output_tokens: ActiveValue::Set(entry.output_tokens),
            cache_read_tokens: ActiveValue::Set(entry.cache_read_tokens),
            cache_creation_tokens: ActiveValue::Set(entry.cache_creation_tokens),
            message: ActiveValue::Set(entry.message),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    async fn list_logs(
        &self,
        since: i64,
        limit: usize,
        offset: usize,
        filter: Option<LogFilter>,
    ) -> StoreResult<Vec<LogEntry>> {
        use entities::request_logs::Column;
        let mut query = entities::RequestLogs::find().filter(Column::At.gte(since));
        if let Some(filter) = filter {
            if let Some(channel_id) = filter.channel_id {
                query = query.filter(Column::ChannelId.eq(channel_id));
            }
            if let Some(model) = filter.model {
                query = query.filter(Column::Model.eq(model));
            }
            if let Some(status_code) = filter.status_code {
                query = query.filter(Column::StatusCode.eq(status_code));
            }
        }
        let rows = query
            .order_by_desc(Column::At)
            .order_by_desc(Column::Id)
            .limit(limit as u64)
            .offset(offset as u64)
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(log_from_model).collect())
    }

    async fn get_auth_token_by_hash(&self, token_hash: &str) -> StoreResult<Option<AuthToken>> {
        use entities::auth_tokens::Column;
        let row = entities::AuthTokens::find()
            .filter(Column::TokenHash.eq(token_hash))
            .one(&self.db)
            .await?;
        row.map(token_from_model).transpose()
    }

    async fn create_auth_token(&self, draft: AuthTokenDraft) -> StoreResult<AuthToken> {
        let now = OffsetDateTime::now_utc();
        let inserted = entities::auth_tokens::ActiveModel {
            token_hash: ActiveValue::Set(draft.token_hash),
            description: ActiveValue::Set(draft.description),
            expires_at_ms: ActiveValue::Set(draft.expires_at_ms),
            last_used_at_ms: ActiveValue::Set(None),
            is_active: ActiveValue::Set(true),
            allowed_models: ActiveValue::Set(serde_json::to_value(&draft.allowed_models)?),
            cost_used_micro_usd: ActiveValue::Set(0),
            cost_limit_micro_usd: ActiveValue::Set(draft.cost_limit_micro_usd),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        token_from_model(inserted)
    }

    async fn add_token_cost(&self, token_id: i64, delta_micro_usd: i64) -> StoreResult<()> {
        use entities::auth_tokens::Column;
        entities::AuthTokens::update_many()
            .col_expr(
                Column::CostUsedMicroUsd,
                sea_orm::sea_query::ExprTrait::add(
                    Expr::col(Column::CostUsedMicroUsd),
                    delta_micro_usd,
                ),
            )
            .filter(Column::Id.eq(token_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn touch_token_last_used(&self, token_id: i64, at_ms: i64) -> StoreResult<()> {
        use entities::auth_tokens::Column;
        entities::AuthTokens::update_many()
            .col_expr(Column::LastUsedAtMs, Expr::value(at_ms))
            .filter(Column::Id.eq(token_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
