//! Perspective state persistence.
//!
//! One table per perspective (`wh_per_<name>` by default), rows shaped
//! `(id, data_json, metadata_json, scope_json, created_at, updated_at,
//! version)`. Visibility filtering is containment-search over the
//! `AllowedPrincipals` array inside `scope_json`: a row is visible when any
//! caller principal appears in it, or when the row carries no scope at all.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use wh_config::TableNames;

#[derive(Debug, Clone)]
pub struct PerspectiveStateRow {
    pub id: String,
    pub data_json: Value,
    pub metadata_json: Option<Value>,
    pub scope_json: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

pub struct PgPerspectiveStateStore {
    pool: PgPool,
    tables: TableNames,
}

impl PgPerspectiveStateStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    /// Create the state table for a perspective if it does not exist.
    /// Idempotent; called once per perspective at runner startup.
    pub async fn ensure_state_table(&self, perspective: &str) -> Result<()> {
        let sql = format!(
            r#"
            create table if not exists {tbl} (
                id            text primary key,
                data_json     jsonb not null,
                metadata_json jsonb,
                scope_json    jsonb,
                created_at    timestamptz not null default now(),
                updated_at    timestamptz not null default now(),
                version       bigint not null default 1
            )
            "#,
            tbl = self.tables.perspective_table(perspective),
        );
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .context("perspective state table creation failed")?;
        Ok(())
    }

    pub async fn upsert_state(
        &self,
        perspective: &str,
        id: &str,
        data_json: &Value,
        metadata_json: Option<&Value>,
        scope_json: Option<&Value>,
    ) -> Result<i64> {
        let sql = format!(
            r#"
            insert into {tbl} as s (id, data_json, metadata_json, scope_json)
            values ($1, $2, $3, $4)
            on conflict (id) do update
                set data_json     = excluded.data_json,
                    metadata_json = excluded.metadata_json,
                    scope_json    = excluded.scope_json,
                    updated_at    = now(),
                    version       = s.version + 1
            returning version
            "#,
            tbl = self.tables.perspective_table(perspective),
        );

        let (version,): (i64,) = sqlx::query_as(&sql)
            .bind(id)
            .bind(data_json)
            .bind(metadata_json)
            .bind(scope_json)
            .fetch_one(&self.pool)
            .await
            .context("perspective state upsert failed")?;
        Ok(version)
    }

    pub async fn fetch(&self, perspective: &str, id: &str) -> Result<Option<PerspectiveStateRow>> {
        let sql = format!(
            r#"
            select id, data_json, metadata_json, scope_json, created_at, updated_at, version
            from {tbl}
            where id = $1
            "#,
            tbl = self.tables.perspective_table(perspective),
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("perspective state fetch failed")?;

        row.map(|r| read_state_row(&r)).transpose()
    }

    /// Rows visible to the given principals: unscoped rows, plus rows whose
    /// `AllowedPrincipals` array contains any of them.
    pub async fn fetch_visible(
        &self,
        perspective: &str,
        principals: &[String],
    ) -> Result<Vec<PerspectiveStateRow>> {
        let sql = format!(
            r#"
            select id, data_json, metadata_json, scope_json, created_at, updated_at, version
            from {tbl}
            where scope_json is null
               or scope_json -> 'AllowedPrincipals' is null
               or scope_json -> 'AllowedPrincipals' ?| $1::text[]
            order by id
            "#,
            tbl = self.tables.perspective_table(perspective),
        );

        let rows = sqlx::query(&sql)
            .bind(principals)
            .fetch_all(&self.pool)
            .await
            .context("perspective visibility query failed")?;

        rows.iter().map(read_state_row).collect()
    }
}

fn read_state_row(row: &sqlx::postgres::PgRow) -> Result<PerspectiveStateRow> {
    Ok(PerspectiveStateRow {
        id: row.try_get("id")?,
        data_json: row.try_get("data_json")?,
        metadata_json: row.try_get("metadata_json")?,
        scope_json: row.try_get("scope_json")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        version: row.try_get("version")?,
    })
}
