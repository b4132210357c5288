//! Request/reply correlation over the `wh_request_response` table.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wh_config::TableNames;
use wh_schemas::RequestResponseRecorder;

pub struct PgRequestResponseStore {
    pool: PgPool,
    tables: TableNames,
}

impl PgRequestResponseStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    /// The recorded response for a correlation, if any completed.
    pub async fn fetch_response(&self, correlation_id: Uuid) -> Result<Option<Value>> {
        let sql = format!(
            "select response_json from {rr} where correlation_id = $1 and completed_at is not null",
            rr = self.tables.table("request_response"),
        );
        let row = sqlx::query(&sql)
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await
            .context("request-response fetch failed")?;
        Ok(row.and_then(|r| r.try_get("response_json").ok()))
    }
}

#[async_trait]
impl RequestResponseRecorder for PgRequestResponseStore {
    async fn record_request(&self, correlation_id: Uuid, request_message_id: Uuid) -> Result<()> {
        let sql = format!(
            r#"
            insert into {rr} (correlation_id, request_message_id)
            values ($1, $2)
            on conflict (correlation_id) do nothing
            "#,
            rr = self.tables.table("request_response"),
        );
        sqlx::query(&sql)
            .bind(correlation_id)
            .bind(request_message_id)
            .execute(&self.pool)
            .await
            .context("request-response request insert failed")?;
        Ok(())
    }

    async fn record_response(&self, correlation_id: Uuid, response: &Value) -> Result<()> {
        let sql = format!(
            r#"
            update {rr}
               set response_json = $2,
                   completed_at  = now()
             where correlation_id = $1
            "#,
            rr = self.tables.table("request_response"),
        );
        sqlx::query(&sql)
            .bind(correlation_id)
            .bind(response)
            .execute(&self.pool)
            .await
            .context("request-response response update failed")?;
        Ok(())
    }
}
