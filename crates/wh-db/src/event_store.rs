//! Read-only event access for perspective replay.
//!
//! Appends happen exclusively inside the coordinator's transaction; this
//! module only reads.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wh_config::TableNames;
use wh_schemas::{EventStoreReader, StoredEvent};

pub struct PgEventStoreReader {
    pool: PgPool,
    tables: TableNames,
}

impl PgEventStoreReader {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    /// Highest version of a stream, or `None` for an unknown stream.
    pub async fn stream_version(&self, stream_id: &str) -> Result<Option<i64>> {
        let sql = format!(
            "select max(version) from {es} where stream_id = $1",
            es = self.tables.table("event_store"),
        );
        let (version,): (Option<i64>,) = sqlx::query_as(&sql)
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await
            .context("stream_version query failed")?;
        Ok(version)
    }
}

#[async_trait]
impl EventStoreReader for PgEventStoreReader {
    async fn events_after(
        &self,
        stream_id: &str,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<StoredEvent>> {
        let sql = format!(
            r#"
            select event_id, stream_id, version, event_type, event_data, metadata, scope, created_at
            from {es}
            where stream_id = $1
              and ($2::uuid is null or event_id > $2)
            order by version asc
            limit $3
            "#,
            es = self.tables.table("event_store"),
        );

        let rows = sqlx::query(&sql)
            .bind(stream_id)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("events_after query failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StoredEvent {
                event_id: row.try_get("event_id")?,
                stream_id: row.try_get("stream_id")?,
                version: row.try_get("version")?,
                event_type: row.try_get("event_type")?,
                event_data: row.try_get("event_data")?,
                metadata: row
                    .try_get::<Option<serde_json::Value>, _>("metadata")?
                    .unwrap_or(serde_json::Value::Null),
                scope: row.try_get("scope")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }
}
