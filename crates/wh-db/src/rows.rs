//! Row types and fetchers for the coordination tables.
//!
//! Used by operators and scenario tests; the coordinator itself works on
//! these rows only inside its transaction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use wh_config::TableNames;
use wh_schemas::MessageStatus;

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub message_id: Uuid,
    pub destination: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope_json: Value,
    pub stream_id: Option<String>,
    pub partition_number: Option<i32>,
    pub is_event: bool,
    pub status: MessageStatus,
    pub attempts: i32,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failure_reason: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct InboxRow {
    pub message_id: Uuid,
    pub handler_name: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope_json: Value,
    pub stream_id: Option<String>,
    pub partition_number: Option<i32>,
    pub is_event: bool,
    pub status: MessageStatus,
    pub attempts: i32,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failure_reason: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PerspectiveCheckpointRow {
    pub stream_id: String,
    pub perspective_name: String,
    pub last_event_id: Option<Uuid>,
    pub status: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceInstanceRow {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    pub last_heartbeat: DateTime<Utc>,
}

pub async fn fetch_outbox_row(
    pool: &PgPool,
    tables: &TableNames,
    message_id: Uuid,
) -> Result<Option<OutboxRow>> {
    let sql = format!(
        r#"
        select message_id, destination, event_type, envelope_type, envelope_json,
               stream_id, partition_number, is_event, status, attempts,
               instance_id, lease_expiry, error, failure_reason,
               scheduled_for, published_at, created_at
        from {outbox}
        where message_id = $1
        "#,
        outbox = tables.table("outbox"),
    );

    let row = sqlx::query(&sql)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .context("fetch_outbox_row failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(OutboxRow {
        message_id: row.try_get("message_id")?,
        destination: row.try_get("destination")?,
        event_type: row.try_get("event_type")?,
        envelope_type: row.try_get("envelope_type")?,
        envelope_json: row.try_get("envelope_json")?,
        stream_id: row.try_get("stream_id")?,
        partition_number: row.try_get("partition_number")?,
        is_event: row.try_get("is_event")?,
        status: MessageStatus::from_bits_retain(row.try_get::<i32, _>("status")?),
        attempts: row.try_get("attempts")?,
        instance_id: row.try_get("instance_id")?,
        lease_expiry: row.try_get("lease_expiry")?,
        error: row.try_get("error")?,
        failure_reason: row.try_get("failure_reason")?,
        scheduled_for: row.try_get("scheduled_for")?,
        published_at: row.try_get("published_at")?,
        created_at: row.try_get("created_at")?,
    }))
}

pub async fn fetch_inbox_row(
    pool: &PgPool,
    tables: &TableNames,
    message_id: Uuid,
) -> Result<Option<InboxRow>> {
    let sql = format!(
        r#"
        select message_id, handler_name, event_type, envelope_type, envelope_json,
               stream_id, partition_number, is_event, status, attempts,
               instance_id, lease_expiry, error, failure_reason,
               received_at, processed_at
        from {inbox}
        where message_id = $1
        "#,
        inbox = tables.table("inbox"),
    );

    let row = sqlx::query(&sql)
        .bind(message_id)
        .fetch_optional(pool)
        .await
        .context("fetch_inbox_row failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(InboxRow {
        message_id: row.try_get("message_id")?,
        handler_name: row.try_get("handler_name")?,
        event_type: row.try_get("event_type")?,
        envelope_type: row.try_get("envelope_type")?,
        envelope_json: row.try_get("envelope_json")?,
        stream_id: row.try_get("stream_id")?,
        partition_number: row.try_get("partition_number")?,
        is_event: row.try_get("is_event")?,
        status: MessageStatus::from_bits_retain(row.try_get::<i32, _>("status")?),
        attempts: row.try_get("attempts")?,
        instance_id: row.try_get("instance_id")?,
        lease_expiry: row.try_get("lease_expiry")?,
        error: row.try_get("error")?,
        failure_reason: row.try_get("failure_reason")?,
        received_at: row.try_get("received_at")?,
        processed_at: row.try_get("processed_at")?,
    }))
}

pub async fn fetch_checkpoint(
    pool: &PgPool,
    tables: &TableNames,
    stream_id: &str,
    perspective_name: &str,
) -> Result<Option<PerspectiveCheckpointRow>> {
    let sql = format!(
        r#"
        select stream_id, perspective_name, last_event_id, status, processed_at, error
        from {pc}
        where stream_id = $1 and perspective_name = $2
        "#,
        pc = tables.table("perspective_checkpoints"),
    );

    let row = sqlx::query(&sql)
        .bind(stream_id)
        .bind(perspective_name)
        .fetch_optional(pool)
        .await
        .context("fetch_checkpoint failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(PerspectiveCheckpointRow {
        stream_id: row.try_get("stream_id")?,
        perspective_name: row.try_get("perspective_name")?,
        last_event_id: row.try_get("last_event_id")?,
        status: row.try_get("status")?,
        processed_at: row.try_get("processed_at")?,
        error: row.try_get("error")?,
    }))
}

pub async fn list_service_instances(
    pool: &PgPool,
    tables: &TableNames,
) -> Result<Vec<ServiceInstanceRow>> {
    let sql = format!(
        r#"
        select instance_id, service_name, host_name, process_id, last_heartbeat
        from {si}
        order by instance_id
        "#,
        si = tables.table("service_instances"),
    );

    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("list_service_instances failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(ServiceInstanceRow {
            instance_id: row.try_get("instance_id")?,
            service_name: row.try_get("service_name")?,
            host_name: row.try_get("host_name")?,
            process_id: row.try_get("process_id")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        });
    }
    Ok(out)
}

pub async fn dedup_contains(pool: &PgPool, tables: &TableNames, message_id: Uuid) -> Result<bool> {
    let sql = format!(
        "select exists (select 1 from {dedup} where message_id = $1)",
        dedup = tables.table("message_deduplication"),
    );

    let (exists,): (bool,) = sqlx::query_as(&sql)
        .bind(message_id)
        .fetch_one(pool)
        .await
        .context("dedup_contains failed")?;
    Ok(exists)
}

/// Operator pruning hook for the dedup table. Refuses horizons younger than
/// the stale-instance threshold: anything the broker could still redeliver
/// within an instance lifetime must stay deduplicated.
pub async fn prune_deduplication_before(
    pool: &PgPool,
    tables: &TableNames,
    horizon: DateTime<Utc>,
    stale_instance_seconds: i64,
) -> Result<u64> {
    let floor = Utc::now() - chrono::Duration::seconds(stale_instance_seconds);
    anyhow::ensure!(
        horizon < floor,
        "dedup prune horizon {horizon} is younger than the stale-instance floor {floor}"
    );

    let sql = format!(
        "delete from {dedup} where first_seen_at < $1",
        dedup = tables.table("message_deduplication"),
    );

    let res = sqlx::query(&sql)
        .bind(horizon)
        .execute(pool)
        .await
        .context("prune_deduplication_before failed")?;
    Ok(res.rows_affected())
}
