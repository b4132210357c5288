//! Postgres backend for the wirehub coordination engine.
//!
//! The single writer to all coordination tables is
//! [`PgCoordinator::process_work_batch`]; everything else in this crate is
//! read access (event replay, row fetchers for tests/operators) or narrowly
//! scoped side channels (out-of-band perspective checkpoints, the sequence
//! allocator, dedup pruning).

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod coordinator;
pub mod event_store;
pub mod perspectives;
pub mod request_response;
pub mod rows;
pub mod sequences;

pub use coordinator::PgCoordinator;
pub use event_store::PgEventStoreReader;
pub use perspectives::PgPerspectiveStateStore;
pub use request_response::PgRequestResponseStore;
pub use rows::{InboxRow, OutboxRow, PerspectiveCheckpointRow, ServiceInstanceRow};

pub const ENV_DB_URL: &str = "WIREHUB_DATABASE_URL";

/// Connect to Postgres using WIREHUB_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using WIREHUB_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations (default `wh_` naming).
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_name = 'wh_outbox'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_outbox_table: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_outbox_table: bool,
}
