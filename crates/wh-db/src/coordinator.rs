//! The work coordinator — the single atomic batch operation.
//!
//! One call performs, in one Postgres transaction: instance heart-beating,
//! stale-instance cleanup, ingestion of new outbox/inbox messages, event
//! append, acknowledgement of completions and failures, lease renewal,
//! hash-partition ownership computation, work claiming, and the return of
//! the next batch this instance should do. All steps commit together or not
//! at all; a retried call after a crash converges to the same state.
//!
//! Partition and ownership hashes are evaluated in SQL
//! (`abs(hashtext(...)::bigint) % n` — widened before `abs` so `i32::MIN`
//! cannot overflow) so every instance sees identical arithmetic regardless
//! of client platform.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wh_config::TableNames;
use wh_schemas::{
    BatchFlags, CompletionReport, Coordinator, CoordinationError, FailureReport, InboxWork,
    MessageStatus, OutboxWork, PerspectiveCompletion, PerspectiveFailure, PerspectiveWork,
    ReadinessProbe, WorkBatch, WorkBatchError, WorkBatchRequest, WorkItemFlags,
};

/// Failure reasons that mark a row `FAILED` permanently. Everything else
/// releases the claim and leaves the row retryable.
fn is_permanent_reason(reason: &str) -> bool {
    matches!(
        reason,
        "SerializationError" | "ValidationError" | "MaxAttemptsExceeded"
    )
}

pub struct PgCoordinator {
    pool: PgPool,
    tables: TableNames,
}

impl PgCoordinator {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    // -----------------------------------------------------------------------
    // Step 1-2: heartbeat + stale cleanup
    // -----------------------------------------------------------------------

    async fn heartbeat(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
    ) -> Result<()> {
        let sql = format!(
            r#"
            insert into {si} (instance_id, service_name, host_name, process_id, metadata_json, last_heartbeat)
            values ($1, $2, $3, $4, $5, now())
            on conflict (instance_id) do update
                set service_name   = excluded.service_name,
                    host_name      = excluded.host_name,
                    process_id     = excluded.process_id,
                    metadata_json  = excluded.metadata_json,
                    last_heartbeat = excluded.last_heartbeat
            "#,
            si = self.tables.table("service_instances"),
        );

        sqlx::query(&sql)
            .bind(req.instance.instance_id)
            .bind(&req.instance.service_name)
            .bind(&req.instance.host_name)
            .bind(req.instance.process_id)
            .bind(&req.instance.metadata)
            .execute(&mut **tx)
            .await
            .context("heartbeat upsert failed")?;
        Ok(())
    }

    async fn stale_cleanup(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stale_seconds: i64,
    ) -> Result<u64> {
        let sql = format!(
            "delete from {si} where last_heartbeat < now() - ($1::bigint * interval '1 second')",
            si = self.tables.table("service_instances"),
        );

        let res = sqlx::query(&sql)
            .bind(stale_seconds)
            .execute(&mut **tx)
            .await
            .context("stale-instance cleanup failed")?;
        Ok(res.rows_affected())
    }

    async fn active_instance_count(&self, tx: &mut Transaction<'_, Postgres>) -> Result<i64> {
        let sql = format!(
            "select count(*) from {si}",
            si = self.tables.table("service_instances"),
        );
        let (n,): (i64,) = sqlx::query_as(&sql)
            .fetch_one(&mut **tx)
            .await
            .context("active instance count failed")?;
        Ok(n)
    }

    async fn owner_slot_of(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        active_count: i64,
    ) -> Result<i64> {
        let (slot,): (i64,) =
            sqlx::query_as("select abs(hashtext($1)::bigint) % $2::bigint")
                .bind(key)
                .bind(active_count)
                .fetch_one(&mut **tx)
                .await
                .context("owner slot computation failed")?;
        Ok(slot)
    }

    // -----------------------------------------------------------------------
    // Step 3-5: ingestion + event append
    // -----------------------------------------------------------------------

    /// Append one event. Returns the assigned version, or `None` on a
    /// `(stream_id, version)` collision — the optimistic-concurrency case,
    /// absorbed by `ON CONFLICT DO NOTHING` so the transaction survives.
    async fn append_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: Uuid,
        stream_id: &str,
        event_type: &str,
        event_data: &serde_json::Value,
        metadata: &serde_json::Value,
        scope: Option<&serde_json::Value>,
    ) -> Result<Option<i64>> {
        let es = self.tables.table("event_store");
        let sql = format!(
            r#"
            insert into {es} (event_id, stream_id, version, event_type, event_data, metadata, scope, created_at)
            select $1, $2,
                   coalesce((select max(version) + 1 from {es} where stream_id = $2), 0),
                   $3, $4, $5, $6, now()
            on conflict (stream_id, version) do nothing
            returning version
            "#,
        );

        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .bind(event_id)
            .bind(stream_id)
            .bind(event_type)
            .bind(event_data)
            .bind(metadata)
            .bind(scope)
            .fetch_optional(&mut **tx)
            .await
            .context("event append failed")?;

        let version = row.map(|(v,)| v);

        // First event of a stream: seed checkpoints for every perspective
        // already known to the checkpoint table, so new streams are picked
        // up without explicit registration.
        if version == Some(0) {
            let pc = self.tables.table("perspective_checkpoints");
            let seed = format!(
                r#"
                insert into {pc} (stream_id, perspective_name, last_event_id, status)
                select $1, p.perspective_name, null, 'active'
                from (select distinct perspective_name from {pc}) p
                on conflict do nothing
                "#,
            );
            sqlx::query(&seed)
                .bind(stream_id)
                .execute(&mut **tx)
                .await
                .context("checkpoint seeding failed")?;
        }

        Ok(version)
    }

    async fn mark_stored_failure(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        message_id: Uuid,
        err: &CoordinationError,
    ) -> Result<()> {
        let sql = format!(
            r#"
            update {table}
               set status         = status | $2,
                   error          = $3,
                   failure_reason = $4
             where message_id = $1
            "#,
        );
        sqlx::query(&sql)
            .bind(message_id)
            .bind(MessageStatus::FAILED.bits())
            .bind(err.to_string())
            .bind(err.reason())
            .execute(&mut **tx)
            .await
            .context("store-failure status update failed")?;
        Ok(())
    }

    async fn ingest_outbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        new_ids: &mut HashSet<Uuid>,
        errors: &mut Vec<WorkBatchError>,
    ) -> Result<()> {
        let outbox = self.tables.table("outbox");
        let insert = format!(
            r#"
            insert into {outbox}
                (message_id, destination, event_type, envelope_type, envelope_json,
                 metadata_json, scope_json, stream_id, partition_number, is_event,
                 status, scheduled_for, created_at)
            values
                ($1, $2, $3, $4, $5, $6, $7, $8,
                 case when $8::text is null
                      then null
                      else (abs(hashtext($8::text)::bigint) % $9::bigint)::int end,
                 $10, $11, $12, now())
            on conflict (message_id) do nothing
            returning message_id
            "#,
        );
        let set_event_stored = format!(
            "update {outbox} set status = status | $2 where message_id = $1",
        );

        for m in &req.new_outbox {
            let inserted: Option<(Uuid,)> = sqlx::query_as(&insert)
                .bind(m.message_id)
                .bind(&m.destination)
                .bind(&m.event_type)
                .bind(&m.envelope_type)
                .bind(&m.envelope_json)
                .bind(&m.metadata_json)
                .bind(m.scope_json.as_ref())
                .bind(m.stream_id.as_deref())
                .bind(i64::from(req.settings.partition_count))
                .bind(m.is_event)
                .bind(MessageStatus::STORED.bits())
                .bind(m.scheduled_for)
                .fetch_optional(&mut **tx)
                .await
                .context("outbox insert failed")?;

            if inserted.is_none() {
                // Idempotent re-store; the first write won.
                continue;
            }
            new_ids.insert(m.message_id);

            if !m.is_event {
                continue;
            }

            let Some(stream_id) = m.stream_id.as_deref() else {
                let err =
                    CoordinationError::Validation("event message without stream_id".to_string());
                errors.push(WorkBatchError::new(m.message_id, &err));
                self.mark_stored_failure(tx, &outbox, m.message_id, &err).await?;
                continue;
            };

            let version = self
                .append_event(
                    tx,
                    m.message_id,
                    stream_id,
                    &m.event_type,
                    &m.envelope_json,
                    &m.metadata_json,
                    m.scope_json.as_ref(),
                )
                .await?;

            match version {
                Some(_) => {
                    sqlx::query(&set_event_stored)
                        .bind(m.message_id)
                        .bind(MessageStatus::EVENT_STORED.bits())
                        .execute(&mut **tx)
                        .await
                        .context("outbox event-stored status update failed")?;
                }
                None => {
                    let err = CoordinationError::OptimisticConcurrency {
                        stream_id: stream_id.to_string(),
                    };
                    errors.push(WorkBatchError::new(m.message_id, &err));
                    self.mark_stored_failure(tx, &outbox, m.message_id, &err).await?;
                }
            }
        }
        Ok(())
    }

    async fn ingest_inbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        new_ids: &mut HashSet<Uuid>,
        errors: &mut Vec<WorkBatchError>,
    ) -> Result<()> {
        let inbox = self.tables.table("inbox");
        let dedup = self.tables.table("message_deduplication");

        let insert = format!(
            r#"
            insert into {inbox}
                (message_id, handler_name, event_type, envelope_type, envelope_json,
                 metadata_json, scope_json, stream_id, partition_number, is_event,
                 status, received_at)
            values
                ($1, $2, $3, $4, $5, $6, $7, $8,
                 case when $8::text is null
                      then null
                      else (abs(hashtext($8::text)::bigint) % $9::bigint)::int end,
                 $10, $11, now())
            on conflict (message_id) do nothing
            returning message_id
            "#,
        );
        let dedup_insert = format!(
            r#"
            insert into {dedup} (message_id, first_seen_at)
            values ($1, now())
            on conflict (message_id) do nothing
            returning message_id
            "#,
        );
        let set_event_stored = format!(
            "update {inbox} set status = status | $2 where message_id = $1",
        );

        for m in &req.new_inbox {
            // Sole point of exactly-once deduplication: the dedup row is
            // permanent, so a replay is rejected even after the inbox row
            // itself terminated and was deleted.
            let first_seen: Option<(Uuid,)> = sqlx::query_as(&dedup_insert)
                .bind(m.message_id)
                .fetch_optional(&mut **tx)
                .await
                .context("dedup insert failed")?;

            if first_seen.is_none() {
                continue;
            }

            let inserted: Option<(Uuid,)> = sqlx::query_as(&insert)
                .bind(m.message_id)
                .bind(&m.handler_name)
                .bind(&m.event_type)
                .bind(&m.envelope_type)
                .bind(&m.envelope_json)
                .bind(&m.metadata_json)
                .bind(m.scope_json.as_ref())
                .bind(m.stream_id.as_deref())
                .bind(i64::from(req.settings.partition_count))
                .bind(m.is_event)
                .bind(MessageStatus::STORED.bits())
                .fetch_optional(&mut **tx)
                .await
                .context("inbox insert failed")?;

            if inserted.is_none() {
                continue;
            }
            new_ids.insert(m.message_id);

            if !m.is_event {
                continue;
            }

            let Some(stream_id) = m.stream_id.as_deref() else {
                let err =
                    CoordinationError::Validation("event message without stream_id".to_string());
                errors.push(WorkBatchError::new(m.message_id, &err));
                self.mark_stored_failure(tx, &inbox, m.message_id, &err).await?;
                continue;
            };

            let version = self
                .append_event(
                    tx,
                    m.message_id,
                    stream_id,
                    &m.event_type,
                    &m.envelope_json,
                    &m.metadata_json,
                    m.scope_json.as_ref(),
                )
                .await?;

            match version {
                Some(_) => {
                    sqlx::query(&set_event_stored)
                        .bind(m.message_id)
                        .bind(MessageStatus::EVENT_STORED.bits())
                        .execute(&mut **tx)
                        .await
                        .context("inbox event-stored status update failed")?;
                }
                None => {
                    let err = CoordinationError::OptimisticConcurrency {
                        stream_id: stream_id.to_string(),
                    };
                    errors.push(WorkBatchError::new(m.message_id, &err));
                    self.mark_stored_failure(tx, &inbox, m.message_id, &err).await?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step 6: completions
    // -----------------------------------------------------------------------

    async fn apply_outbox_completions(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        completions: &[CompletionReport],
        debug_mode: bool,
    ) -> Result<()> {
        let outbox = self.tables.table("outbox");
        let advance = format!(
            r#"
            update {outbox}
               set status       = status | $2,
                   published_at = case when ($2::int & 4) <> 0
                                       then coalesce(published_at, now())
                                       else published_at end
             where message_id = $1
            returning status
            "#,
        );
        let delete = format!("delete from {outbox} where message_id = $1");

        for c in completions {
            // A report for a row already gone is a no-op: repeated
            // acknowledgements are idempotent.
            let row: Option<(i32,)> = sqlx::query_as(&advance)
                .bind(c.message_id)
                .bind(c.status.bits())
                .fetch_optional(&mut **tx)
                .await
                .context("outbox completion update failed")?;

            if let Some((bits,)) = row {
                let status = MessageStatus::from_bits_retain(bits);
                if status.outbox_terminal() && !debug_mode {
                    sqlx::query(&delete)
                        .bind(c.message_id)
                        .execute(&mut **tx)
                        .await
                        .context("outbox terminal delete failed")?;
                }
            }
        }
        Ok(())
    }

    async fn apply_inbox_completions(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        completions: &[CompletionReport],
        debug_mode: bool,
    ) -> Result<()> {
        let inbox = self.tables.table("inbox");
        let advance = format!(
            r#"
            update {inbox}
               set status = status | $2
             where message_id = $1
            returning status, is_event
            "#,
        );
        let mark_processed = format!(
            "update {inbox} set processed_at = coalesce(processed_at, now()) where message_id = $1",
        );
        let delete = format!("delete from {inbox} where message_id = $1");

        for c in completions {
            let row: Option<(i32, bool)> = sqlx::query_as(&advance)
                .bind(c.message_id)
                .bind(c.status.bits())
                .fetch_optional(&mut **tx)
                .await
                .context("inbox completion update failed")?;

            if let Some((bits, is_event)) = row {
                let status = MessageStatus::from_bits_retain(bits);
                if status.inbox_terminal(is_event) {
                    if debug_mode {
                        sqlx::query(&mark_processed)
                            .bind(c.message_id)
                            .execute(&mut **tx)
                            .await
                            .context("inbox processed_at stamp failed")?;
                    } else {
                        sqlx::query(&delete)
                            .bind(c.message_id)
                            .execute(&mut **tx)
                            .await
                            .context("inbox terminal delete failed")?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_receptor_completions(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
    ) -> Result<()> {
        let sql = format!(
            r#"
            insert into {rp} (message_id, receptor_name, succeeded, error, completed_at)
            values ($1, $2, $3, $4, now())
            on conflict (message_id, receptor_name) do update
                set succeeded    = excluded.succeeded,
                    error        = excluded.error,
                    completed_at = excluded.completed_at
            "#,
            rp = self.tables.table("receptor_processing"),
        );

        for r in &req.receptor_completions {
            sqlx::query(&sql)
                .bind(r.message_id)
                .bind(&r.receptor_name)
                .bind(r.succeeded)
                .bind(r.error.as_deref())
                .execute(&mut **tx)
                .await
                .context("receptor completion upsert failed")?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step 7: failures
    // -----------------------------------------------------------------------

    async fn apply_failures(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table_bare: &str,
        failures: &[FailureReport],
        req: &WorkBatchRequest,
        cascade_streams: bool,
    ) -> Result<()> {
        let table = self.tables.table(table_bare);
        let order_col = if table_bare == "inbox" { "received_at" } else { "created_at" };

        let fail = format!(
            r#"
            update {table}
               set status         = case when $5 then $2 | $6 else $2 end,
                   error          = $3,
                   failure_reason = $4,
                   attempts       = attempts + 1,
                   instance_id    = null,
                   lease_expiry   = null
             where message_id = $1
            returning attempts, stream_id
            "#,
        );
        let exhaust = format!(
            r#"
            update {table}
               set status         = status | $2,
                   failure_reason = 'MaxAttemptsExceeded'
             where message_id = $1
            "#,
        );
        let cascade = format!(
            r#"
            update {table}
               set instance_id = null, lease_expiry = null
             where stream_id = $1
               and instance_id = $2
               and ({order_col}, message_id) >
                   (select {order_col}, message_id from {table} where message_id = $3)
            "#,
        );

        for f in failures {
            let permanent = is_permanent_reason(&f.reason);
            let row: Option<(i32, Option<String>)> = sqlx::query_as(&fail)
                .bind(f.message_id)
                .bind(f.completed.bits())
                .bind(&f.error)
                .bind(&f.reason)
                .bind(permanent)
                .bind(MessageStatus::FAILED.bits())
                .fetch_optional(&mut **tx)
                .await
                .context("failure status update failed")?;

            let Some((attempts, stream_id)) = row else {
                // Row already terminal or deleted; stale report.
                continue;
            };

            if !permanent && attempts >= req.settings.max_attempts {
                sqlx::query(&exhaust)
                    .bind(f.message_id)
                    .bind(MessageStatus::FAILED.bits())
                    .execute(&mut **tx)
                    .await
                    .context("max-attempts exhaustion update failed")?;
            }

            // Failed inbox message with a stream: release everything later
            // in the stream still claimed by this instance, so the next
            // pass re-claims in order.
            if cascade_streams {
                if let Some(stream_id) = stream_id {
                    sqlx::query(&cascade)
                        .bind(&stream_id)
                        .bind(req.instance.instance_id)
                        .bind(f.message_id)
                        .execute(&mut **tx)
                        .await
                        .context("stream failure cascade failed")?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step 8: lease renewal
    // -----------------------------------------------------------------------

    async fn renew_leases(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table_bare: &str,
        ids: &[Uuid],
        req: &WorkBatchRequest,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        // Renewal silently skips ids the caller no longer owns.
        let sql = format!(
            r#"
            update {table}
               set lease_expiry = now() + ($2::bigint * interval '1 second')
             where message_id = any($1)
               and instance_id = $3
            "#,
            table = self.tables.table(table_bare),
        );
        sqlx::query(&sql)
            .bind(ids)
            .bind(req.settings.lease_seconds)
            .bind(req.instance.instance_id)
            .execute(&mut **tx)
            .await
            .context("lease renewal failed")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step 9-10: claiming
    // -----------------------------------------------------------------------

    /// Claim predicate, shared shape for outbox and inbox:
    /// - not permanently failed, not past its terminal stage;
    /// - unclaimed or lease expired; not scheduled into the future;
    /// - this instance owns the stream's hash slot;
    /// - stream-ordering guard: no earlier live row of the same stream is
    ///   held by a different live instance, permanently failed, or carrying
    ///   a recorded failure (`attempts > 0`) — a failed head withholds its
    ///   stream's tail until it succeeds.
    async fn claim_outbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        active_count: i64,
        my_slot: i64,
        new_ids: &HashSet<Uuid>,
    ) -> Result<Vec<OutboxWork>> {
        let outbox = self.tables.table("outbox");
        let sql = format!(
            r#"
            with candidate as (
                select c.message_id,
                       (c.instance_id is not null) as reclaimed
                from {outbox} c
                where (c.status & $6) = 0
                  and (c.status & 4) = 0
                  and (c.instance_id is null or c.lease_expiry < now())
                  and (c.scheduled_for is null or c.scheduled_for <= now())
                  and abs(hashtext(coalesce(c.stream_id, ''))::bigint) % $1::bigint = $2
                  and not exists (
                      select 1
                      from {outbox} e
                      where c.stream_id is not null
                        and e.stream_id = c.stream_id
                        and (e.created_at, e.message_id) < (c.created_at, c.message_id)
                        and (e.status & 4) = 0
                        and (
                             (e.instance_id is not null
                              and e.instance_id <> $3
                              and e.lease_expiry >= now())
                          or (e.status & $6) <> 0
                          or e.attempts > 0
                        )
                  )
                order by c.created_at, c.message_id
                limit $4
                for update skip locked
            )
            update {outbox} o
               set instance_id  = $3,
                   lease_expiry = now() + ($5::bigint * interval '1 second')
              from candidate
             where o.message_id = candidate.message_id
            returning o.message_id, o.destination, o.event_type, o.envelope_type,
                      o.envelope_json, o.stream_id, o.partition_number, o.is_event,
                      o.status, o.attempts,
                      (extract(epoch from o.created_at) * 1000)::bigint as sequence_order,
                      candidate.reclaimed
            "#,
        );

        let rows = sqlx::query(&sql)
            .bind(active_count)
            .bind(my_slot)
            .bind(req.instance.instance_id)
            .bind(req.settings.claim_batch_size)
            .bind(req.settings.lease_seconds)
            .bind(MessageStatus::FAILED.bits())
            .fetch_all(&mut **tx)
            .await
            .context("outbox claim failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: Uuid = row.try_get("message_id")?;
            let reclaimed: bool = row.try_get("reclaimed")?;
            let mut flags = WorkItemFlags::empty();
            if new_ids.contains(&message_id) {
                flags |= WorkItemFlags::NEWLY_STORED;
            }
            if reclaimed {
                flags |= WorkItemFlags::ORPHANED;
            }
            out.push(OutboxWork {
                message_id,
                destination: row.try_get("destination")?,
                event_type: row.try_get("event_type")?,
                envelope_type: row.try_get("envelope_type")?,
                envelope_json: row.try_get("envelope_json")?,
                stream_id: row.try_get("stream_id")?,
                partition_number: row.try_get("partition_number")?,
                is_event: row.try_get("is_event")?,
                status: MessageStatus::from_bits_retain(row.try_get::<i32, _>("status")?),
                flags,
                attempts: row.try_get("attempts")?,
                sequence_order: row.try_get("sequence_order")?,
            });
        }
        out.sort_by(|a, b| (a.sequence_order, a.message_id).cmp(&(b.sequence_order, b.message_id)));
        Ok(out)
    }

    async fn claim_inbox(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        active_count: i64,
        my_slot: i64,
        new_ids: &HashSet<Uuid>,
    ) -> Result<Vec<InboxWork>> {
        let inbox = self.tables.table("inbox");
        let sql = format!(
            r#"
            with candidate as (
                select c.message_id,
                       (c.instance_id is not null) as reclaimed
                from {inbox} c
                where (c.status & $6) = 0
                  and c.processed_at is null
                  and (c.instance_id is null or c.lease_expiry < now())
                  and (c.scheduled_for is null or c.scheduled_for <= now())
                  and abs(hashtext(coalesce(c.stream_id, ''))::bigint) % $1::bigint = $2
                  and not exists (
                      select 1
                      from {inbox} e
                      where c.stream_id is not null
                        and e.stream_id = c.stream_id
                        and (e.received_at, e.message_id) < (c.received_at, c.message_id)
                        and e.processed_at is null
                        and (
                             (e.instance_id is not null
                              and e.instance_id <> $3
                              and e.lease_expiry >= now())
                          or (e.status & $6) <> 0
                          or e.attempts > 0
                        )
                  )
                order by c.received_at, c.message_id
                limit $4
                for update skip locked
            )
            update {inbox} i
               set instance_id  = $3,
                   lease_expiry = now() + ($5::bigint * interval '1 second')
              from candidate
             where i.message_id = candidate.message_id
            returning i.message_id, i.handler_name, i.event_type, i.envelope_type,
                      i.envelope_json, i.stream_id, i.partition_number, i.is_event,
                      i.status, i.attempts,
                      (extract(epoch from i.received_at) * 1000)::bigint as sequence_order,
                      candidate.reclaimed
            "#,
        );

        let rows = sqlx::query(&sql)
            .bind(active_count)
            .bind(my_slot)
            .bind(req.instance.instance_id)
            .bind(req.settings.claim_batch_size)
            .bind(req.settings.lease_seconds)
            .bind(MessageStatus::FAILED.bits())
            .fetch_all(&mut **tx)
            .await
            .context("inbox claim failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: Uuid = row.try_get("message_id")?;
            let reclaimed: bool = row.try_get("reclaimed")?;
            let mut flags = WorkItemFlags::empty();
            if new_ids.contains(&message_id) {
                flags |= WorkItemFlags::NEWLY_STORED;
            }
            if reclaimed {
                flags |= WorkItemFlags::ORPHANED;
            }
            out.push(InboxWork {
                message_id,
                handler_name: row.try_get("handler_name")?,
                event_type: row.try_get("event_type")?,
                envelope_type: row.try_get("envelope_type")?,
                envelope_json: row.try_get("envelope_json")?,
                stream_id: row.try_get("stream_id")?,
                partition_number: row.try_get("partition_number")?,
                is_event: row.try_get("is_event")?,
                status: MessageStatus::from_bits_retain(row.try_get::<i32, _>("status")?),
                flags,
                attempts: row.try_get("attempts")?,
                sequence_order: row.try_get("sequence_order")?,
            });
        }
        out.sort_by(|a, b| (a.sequence_order, a.message_id).cmp(&(b.sequence_order, b.message_id)));
        Ok(out)
    }

    /// Record sticky stream ownership for the streams claimed this call.
    async fn record_active_streams(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        outbox: &[OutboxWork],
        inbox: &[InboxWork],
    ) -> Result<()> {
        let sql = format!(
            r#"
            insert into {actives} (stream_id, partition_number, assigned_instance_id, lease_expiry, updated_at)
            values ($1, $2, $3, now() + ($4::bigint * interval '1 second'), now())
            on conflict (stream_id) do update
                set partition_number     = excluded.partition_number,
                    assigned_instance_id = excluded.assigned_instance_id,
                    lease_expiry         = excluded.lease_expiry,
                    updated_at           = excluded.updated_at
            "#,
            actives = self.tables.table("active_streams"),
        );

        let mut seen: HashSet<&str> = HashSet::new();
        let claimed = outbox
            .iter()
            .filter_map(|w| w.stream_id.as_deref().zip(w.partition_number))
            .chain(
                inbox
                    .iter()
                    .filter_map(|w| w.stream_id.as_deref().zip(w.partition_number)),
            );

        for (stream_id, partition) in claimed {
            if !seen.insert(stream_id) {
                continue;
            }
            sqlx::query(&sql)
                .bind(stream_id)
                .bind(partition)
                .bind(req.instance.instance_id)
                .bind(req.settings.lease_seconds)
                .execute(&mut **tx)
                .await
                .context("active-stream upsert failed")?;
        }
        Ok(())
    }

    async fn claim_perspective_work(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        active_count: i64,
        my_slot: i64,
    ) -> Result<Vec<PerspectiveWork>> {
        let sql = format!(
            r#"
            select c.stream_id, c.perspective_name, c.last_event_id
            from {pc} c
            where c.status <> 'failed'
              and abs(hashtext(c.stream_id)::bigint) % $1::bigint = $2
              and exists (
                  select 1 from {es} e
                  where e.stream_id = c.stream_id
                    and (c.last_event_id is null or e.event_id > c.last_event_id)
              )
            order by c.stream_id, c.perspective_name
            limit $3
            "#,
            pc = self.tables.table("perspective_checkpoints"),
            es = self.tables.table("event_store"),
        );

        let rows = sqlx::query(&sql)
            .bind(active_count)
            .bind(my_slot)
            .bind(req.settings.claim_batch_size)
            .fetch_all(&mut **tx)
            .await
            .context("perspective work query failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PerspectiveWork {
                stream_id: row.try_get("stream_id")?,
                perspective_name: row.try_get("perspective_name")?,
                last_event_id: row.try_get("last_event_id")?,
            });
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Checkpoint upserts (shared by the batched and out-of-band paths)
    // -----------------------------------------------------------------------

    async fn upsert_checkpoint_completion(
        &self,
        conn: &mut PgConnection,
        c: &PerspectiveCompletion,
    ) -> Result<()> {
        let sql = format!(
            r#"
            insert into {pc} (stream_id, perspective_name, last_event_id, status, processed_at, error)
            values ($1, $2, $3, 'active', now(), null)
            on conflict (stream_id, perspective_name) do update
                set last_event_id = excluded.last_event_id,
                    status        = 'active',
                    processed_at  = excluded.processed_at,
                    error         = null
            "#,
            pc = self.tables.table("perspective_checkpoints"),
        );
        sqlx::query(&sql)
            .bind(&c.stream_id)
            .bind(&c.perspective_name)
            .bind(c.last_event_id)
            .execute(conn)
            .await
            .context("perspective checkpoint completion failed")?;
        Ok(())
    }

    async fn upsert_checkpoint_failure(
        &self,
        conn: &mut PgConnection,
        f: &PerspectiveFailure,
    ) -> Result<()> {
        // last_event_id stays where it was: replay resumes at the failed
        // event once the checkpoint is reactivated.
        let sql = format!(
            r#"
            insert into {pc} (stream_id, perspective_name, last_event_id, status, processed_at, error)
            values ($1, $2, null, 'failed', now(), $3)
            on conflict (stream_id, perspective_name) do update
                set status       = 'failed',
                    processed_at = excluded.processed_at,
                    error        = excluded.error
            "#,
            pc = self.tables.table("perspective_checkpoints"),
        );
        let detail = match f.failed_event_id {
            Some(id) => format!("{} (event {id})", f.error),
            None => f.error.clone(),
        };
        sqlx::query(&sql)
            .bind(&f.stream_id)
            .bind(&f.perspective_name)
            .bind(detail)
            .execute(conn)
            .await
            .context("perspective checkpoint failure failed")?;
        Ok(())
    }

    /// Register a perspective: create (or keep) a checkpoint per existing
    /// stream so the projection catches up on history, and remember the
    /// name for streams created later.
    pub async fn register_perspective(&self, perspective_name: &str) -> Result<u64> {
        let sql = format!(
            r#"
            insert into {pc} (stream_id, perspective_name, last_event_id, status)
            select distinct stream_id, $1, null, 'active'
            from {es}
            on conflict do nothing
            "#,
            pc = self.tables.table("perspective_checkpoints"),
            es = self.tables.table("event_store"),
        );
        let res = sqlx::query(&sql)
            .bind(perspective_name)
            .execute(&self.pool)
            .await
            .context("perspective registration failed")?;
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------------
    // The batch itself
    // -----------------------------------------------------------------------

    async fn run_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        req: &WorkBatchRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkBatch> {
        let debug_mode = req.flags.contains(BatchFlags::DEBUG_MODE);
        let mut errors: Vec<WorkBatchError> = Vec::new();
        let mut new_ids: HashSet<Uuid> = HashSet::new();

        self.heartbeat(tx, req).await?;
        let removed = self.stale_cleanup(tx, req.settings.stale_instance_seconds).await?;
        if removed > 0 {
            tracing::info!(removed, "removed stale service instances");
        }

        let active_count = self.active_instance_count(tx).await?;
        let my_slot = self
            .owner_slot_of(tx, &req.instance.instance_id.to_string(), active_count)
            .await?;

        self.ingest_outbox(tx, req, &mut new_ids, &mut errors).await?;
        self.ingest_inbox(tx, req, &mut new_ids, &mut errors).await?;

        if cancel.is_cancelled() {
            bail!("work batch cancelled during ingestion");
        }

        self.apply_outbox_completions(tx, &req.outbox_completions, debug_mode).await?;
        self.apply_inbox_completions(tx, &req.inbox_completions, debug_mode).await?;
        self.apply_receptor_completions(tx, req).await?;
        for c in &req.perspective_completions {
            self.upsert_checkpoint_completion(&mut **tx, c).await?;
        }
        for f in &req.perspective_failures {
            self.upsert_checkpoint_failure(&mut **tx, f).await?;
        }

        self.apply_failures(tx, "outbox", &req.outbox_failures, req, false).await?;
        self.apply_failures(tx, "inbox", &req.inbox_failures, req, true).await?;

        self.renew_leases(tx, "outbox", &req.renew_outbox, req).await?;
        self.renew_leases(tx, "inbox", &req.renew_inbox, req).await?;

        if cancel.is_cancelled() {
            bail!("work batch cancelled before claim");
        }

        let (outbox, inbox, perspectives) = if req.flags.contains(BatchFlags::SKIP_CLAIM) {
            (Vec::new(), Vec::new(), Vec::new())
        } else {
            let outbox = self.claim_outbox(tx, req, active_count, my_slot, &new_ids).await?;
            let inbox = self.claim_inbox(tx, req, active_count, my_slot, &new_ids).await?;
            self.record_active_streams(tx, req, &outbox, &inbox).await?;
            let perspectives = self
                .claim_perspective_work(tx, req, active_count, my_slot)
                .await?;
            (outbox, inbox, perspectives)
        };

        Ok(WorkBatch {
            outbox,
            inbox,
            perspectives,
            errors,
            active_instances: active_count,
        })
    }
}

#[async_trait]
impl Coordinator for PgCoordinator {
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkBatch> {
        request.settings.validate()?;
        if cancel.is_cancelled() {
            bail!("work batch cancelled");
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin work-batch transaction")?;

        match self.run_batch(&mut tx, &request, cancel).await {
            Ok(batch) => {
                if cancel.is_cancelled() {
                    // Leases granted in this call must not be persisted.
                    let _ = tx.rollback().await;
                    bail!("work batch cancelled before commit");
                }
                tx.commit().await.context("commit work-batch transaction")?;
                Ok(batch)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn report_perspective_completion(
        &self,
        completion: &PerspectiveCompletion,
    ) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection for checkpoint report")?;
        self.upsert_checkpoint_completion(&mut conn, completion).await
    }

    async fn report_perspective_failure(&self, failure: &PerspectiveFailure) -> Result<()> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection for checkpoint report")?;
        self.upsert_checkpoint_failure(&mut conn, failure).await
    }
}

#[async_trait]
impl ReadinessProbe for PgCoordinator {
    async fn is_ready(&self) -> bool {
        self.pool.acquire().await.is_ok()
    }
}
