//! Named monotonic sequence allocator over the `wh_sequences` table.
//!
//! Gap-free per name, unlike Postgres sequences which leak values on
//! rollback. Allocation rides the row lock taken by the upsert, so
//! concurrent callers serialize per name.

use anyhow::{Context, Result};
use sqlx::PgPool;
use wh_config::TableNames;

pub async fn next_sequence(pool: &PgPool, tables: &TableNames, name: &str) -> Result<i64> {
    let sql = format!(
        r#"
        insert into {seq} as s (name, value)
        values ($1, 1)
        on conflict (name) do update
            set value = s.value + 1
        returning s.value
        "#,
        seq = tables.table("sequences"),
    );

    let (value,): (i64,) = sqlx::query_as(&sql)
        .bind(name)
        .fetch_one(pool)
        .await
        .context("sequence allocation failed")?;
    Ok(value)
}
