use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, DbConn, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, sea_query::OnConflict,
};
use time::OffsetDateTime;
use tracing::{debug, instrument};

use crate::{config::db_conn_capsule, link_params::to_epoch_millis, orm::kv_entry};

pub fn kv_store_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn KvStore> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(SqlKvStore { db })
}

/// One page of a key listing. `cursor` is `None` on the last page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<String>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Entries past their store-level expiry read as absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Reads the value under `key` even when its store-level expiry has passed.
    async fn get_including_expired(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Inserts or replaces the value under `key`.
    async fn put(
        &self,
        key: &str,
        value: String,
        expires_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<()>;

    /// Deleting a missing key is a no-op.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Lists keys in ascending order, starting after `cursor`.
    /// Keys whose store-level expiry has passed are still listed.
    async fn list_keys(&self, cursor: Option<String>, limit: u64) -> anyhow::Result<KeyPage>;

    /// Drops entries whose store-level expiry is before `now`, returning how many.
    /// Callers must have reconciled those entries first; a purged value is gone for good.
    async fn purge_expired(&self, now: OffsetDateTime) -> anyhow::Result<u64>;
}

/// Creates the backing table when it does not exist yet.
///
/// # Errors
/// Will return [`Err`] if the DDL statement fails.
pub async fn ensure_schema(db: &DbConn) -> Result<(), DbErr> {
    db.execute_unprepared(
        "CREATE TABLE IF NOT EXISTS kv_entries (\
            key VARCHAR(255) NOT NULL PRIMARY KEY, \
            value TEXT NOT NULL, \
            expires_at_ms BIGINT NULL\
        )",
    )
    .await?;
    Ok(())
}

pub struct SqlKvStore {
    db: DbConn,
}

impl SqlKvStore {
    #[must_use]
    pub fn new(db: DbConn) -> Self {
        Self { db }
    }

    async fn find_entry(&self, key: &str) -> anyhow::Result<Option<kv_entry::Model>> {
        kv_entry::Entity::find_by_id(key)
            .one(&self.db)
            .await
            .with_context(|| format!("Failed to read key {key}"))
    }
}

#[async_trait]
impl KvStore for SqlKvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let now_ms = to_epoch_millis(OffsetDateTime::now_utc());
        Ok(self
            .find_entry(key)
            .await?
            .filter(|entry| entry.expires_at_ms.is_none_or(|expires_at| expires_at > now_ms))
            .map(|entry| entry.value))
    }

    #[instrument(skip(self))]
    async fn get_including_expired(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.find_entry(key).await?.map(|entry| entry.value))
    }

    #[instrument(skip(self, value))]
    async fn put(
        &self,
        key: &str,
        value: String,
        expires_at: Option<OffsetDateTime>,
    ) -> anyhow::Result<()> {
        let to_insert = kv_entry::ActiveModel {
            key: Set(key.to_owned()),
            value: Set(value),
            expires_at_ms: Set(expires_at.map(to_epoch_millis)),
        };
        kv_entry::Entity::insert(to_insert)
            .on_conflict(
                OnConflict::column(kv_entry::Column::Key)
                    .update_columns([kv_entry::Column::Value, kv_entry::Column::ExpiresAtMs])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .with_context(|| format!("Failed to write key {key}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let result = kv_entry::Entity::delete_by_id(key)
            .exec(&self.db)
            .await
            .with_context(|| format!("Failed to delete key {key}"))?;
        debug!(rows_affected = result.rows_affected, "Deleted key");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_keys(&self, cursor: Option<String>, limit: u64) -> anyhow::Result<KeyPage> {
        let mut query = kv_entry::Entity::find()
            .select_only()
            .column(kv_entry::Column::Key)
            .order_by_asc(kv_entry::Column::Key)
            .limit(limit + 1);
        if let Some(cursor) = cursor {
            query = query.filter(kv_entry::Column::Key.gt(cursor));
        }

        let mut keys: Vec<String> = query
            .into_tuple()
            .all(&self.db)
            .await
            .context("Failed to list keys")?;

        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        let cursor = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().cloned()
        } else {
            None
        };
        Ok(KeyPage { keys, cursor })
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, now: OffsetDateTime) -> anyhow::Result<u64> {
        let result = kv_entry::Entity::delete_many()
            .filter(kv_entry::Column::ExpiresAtMs.lt(to_epoch_millis(now)))
            .exec(&self.db)
            .await
            .context("Failed to purge expired keys")?;
        Ok(result.rows_affected)
    }
}
