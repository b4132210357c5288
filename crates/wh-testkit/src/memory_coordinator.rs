//! The in-memory coordinator.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wh_schemas::{
    owner_slot, partition_for_stream, BatchFlags, Coordinator, CoordinationError,
    EventStoreReader, InboxWork, MessageStatus, OutboxWork, PerspectiveCompletion,
    PerspectiveFailure, PerspectiveWork, ReadinessProbe, StoredEvent, WorkBatch, WorkBatchError,
    WorkBatchRequest, WorkItemFlags,
};

fn is_permanent_reason(reason: &str) -> bool {
    matches!(
        reason,
        "SerializationError" | "ValidationError" | "MaxAttemptsExceeded"
    )
}

#[derive(Debug, Clone)]
pub struct MemOutboxRow {
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
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MemInboxRow {
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
pub struct MemCheckpoint {
    pub last_event_id: Option<Uuid>,
    pub status: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct MemInstance {
    last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MemActiveStream {
    pub partition_number: i32,
    pub assigned_instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

struct State {
    now: DateTime<Utc>,
    instances: BTreeMap<Uuid, MemInstance>,
    outbox: BTreeMap<Uuid, MemOutboxRow>,
    inbox: BTreeMap<Uuid, MemInboxRow>,
    events: Vec<StoredEvent>,
    dedup: BTreeMap<Uuid, DateTime<Utc>>,
    checkpoints: BTreeMap<(String, String), MemCheckpoint>,
    active_streams: BTreeMap<String, MemActiveStream>,
    receptor_processing: BTreeMap<(Uuid, String), (bool, Option<String>)>,
    conflict_streams: BTreeSet<String>,
}

impl State {
    /// Current virtual time, advancing 1 ms per call so insertion order is
    /// total without any sleeping.
    fn tick(&mut self) -> DateTime<Utc> {
        let t = self.now;
        self.now += Duration::milliseconds(1);
        t
    }

    fn append_event(
        &mut self,
        event_id: Uuid,
        stream_id: &str,
        event_type: &str,
        event_data: &Value,
        scope: Option<&Value>,
    ) -> Option<i64> {
        if self.conflict_streams.remove(stream_id) {
            return None;
        }
        let version = self
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .map(|e| e.version + 1)
            .max()
            .unwrap_or(0);
        let created_at = self.tick();
        self.events.push(StoredEvent {
            event_id,
            stream_id: stream_id.to_string(),
            version,
            event_type: event_type.to_string(),
            event_data: event_data.clone(),
            metadata: Value::Null,
            scope: scope.cloned(),
            created_at,
        });

        // First event of a stream: seed checkpoints for known perspectives.
        if version == 0 {
            let names: BTreeSet<String> = self
                .checkpoints
                .keys()
                .map(|(_, name)| name.clone())
                .collect();
            for name in names {
                self.checkpoints
                    .entry((stream_id.to_string(), name))
                    .or_insert(MemCheckpoint {
                        last_event_id: None,
                        status: "active".to_string(),
                        error: None,
                    });
            }
        }

        Some(version)
    }
}

pub struct MemoryCoordinator {
    state: Mutex<State>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                now: Utc::now(),
                instances: BTreeMap::new(),
                outbox: BTreeMap::new(),
                inbox: BTreeMap::new(),
                events: Vec::new(),
                dedup: BTreeMap::new(),
                checkpoints: BTreeMap::new(),
                active_streams: BTreeMap::new(),
                receptor_processing: BTreeMap::new(),
                conflict_streams: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the virtual clock — lease and staleness scenarios without
    /// wall-clock sleeping.
    pub fn advance(&self, seconds: i64) {
        self.lock().now += Duration::seconds(seconds);
    }

    /// Make the next event append on `stream` report an
    /// optimistic-concurrency conflict.
    pub fn fail_next_append(&self, stream: &str) {
        self.lock().conflict_streams.insert(stream.to_string());
    }

    /// Create checkpoints for every stream currently in the event store,
    /// and remember the name for streams created later.
    pub fn register_perspective(&self, perspective_name: &str) -> usize {
        let mut state = self.lock();
        let streams: BTreeSet<String> =
            state.events.iter().map(|e| e.stream_id.clone()).collect();
        let mut created = 0;
        // A name with no streams yet still needs a marker row so later
        // streams pick it up; mirror the registration query's behavior by
        // seeding only real streams (matching the SQL backend).
        for stream in streams {
            let key = (stream, perspective_name.to_string());
            if !state.checkpoints.contains_key(&key) {
                state.checkpoints.insert(
                    key,
                    MemCheckpoint {
                        last_event_id: None,
                        status: "active".to_string(),
                        error: None,
                    },
                );
                created += 1;
            }
        }
        created
    }

    // -- inspection helpers -------------------------------------------------

    pub fn outbox_row(&self, message_id: Uuid) -> Option<MemOutboxRow> {
        self.lock().outbox.get(&message_id).cloned()
    }

    pub fn inbox_row(&self, message_id: Uuid) -> Option<MemInboxRow> {
        self.lock().inbox.get(&message_id).cloned()
    }

    pub fn inbox_len(&self) -> usize {
        self.lock().inbox.len()
    }

    pub fn dedup_contains(&self, message_id: Uuid) -> bool {
        self.lock().dedup.contains_key(&message_id)
    }

    pub fn stream_events(&self, stream_id: &str) -> Vec<StoredEvent> {
        let mut out: Vec<StoredEvent> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.version);
        out
    }

    pub fn checkpoint(&self, stream_id: &str, perspective: &str) -> Option<MemCheckpoint> {
        self.lock()
            .checkpoints
            .get(&(stream_id.to_string(), perspective.to_string()))
            .cloned()
    }

    pub fn active_instances(&self) -> Vec<Uuid> {
        self.lock().instances.keys().copied().collect()
    }

    pub fn active_stream(&self, stream_id: &str) -> Option<MemActiveStream> {
        self.lock().active_streams.get(stream_id).cloned()
    }

    pub fn receptor_record(&self, message_id: Uuid, receptor: &str) -> Option<(bool, Option<String>)> {
        self.lock()
            .receptor_processing
            .get(&(message_id, receptor.to_string()))
            .cloned()
    }

    /// Ownership slot of each of `count` partitions under the current
    /// active-instance set, keyed the way the claim predicate keys streams.
    pub fn partition_owners(&self, partition_count: i32) -> BTreeMap<i32, usize> {
        let state = self.lock();
        let active = state.instances.len().max(1);
        (0..partition_count)
            .map(|p| (p, owner_slot(&p.to_string(), active)))
            .collect()
    }

    // -- the eleven steps ---------------------------------------------------

    fn run_batch(&self, req: &WorkBatchRequest) -> WorkBatch {
        let mut state = self.lock();
        let debug_mode = req.flags.contains(BatchFlags::DEBUG_MODE);
        let mut errors: Vec<WorkBatchError> = Vec::new();
        let mut new_ids: HashSet<Uuid> = HashSet::new();

        // 1. Heartbeat.
        let now = state.now;
        state
            .instances
            .insert(req.instance.instance_id, MemInstance { last_heartbeat: now });

        // 2. Stale cleanup.
        let stale_floor = now - Duration::seconds(req.settings.stale_instance_seconds);
        state.instances.retain(|_, i| i.last_heartbeat >= stale_floor);

        let active_count = state.instances.len().max(1);
        let my_slot = owner_slot(&req.instance.instance_id.to_string(), active_count);

        // 3-4. Ingest outbox, appending events.
        for m in &req.new_outbox {
            if state.outbox.contains_key(&m.message_id) {
                continue;
            }
            new_ids.insert(m.message_id);
            let created_at = state.tick();
            let mut row = MemOutboxRow {
                message_id: m.message_id,
                destination: m.destination.clone(),
                event_type: m.event_type.clone(),
                envelope_type: m.envelope_type.clone(),
                envelope_json: m.envelope_json.clone(),
                stream_id: m.stream_id.clone(),
                partition_number: m
                    .stream_id
                    .as_deref()
                    .map(|s| partition_for_stream(Some(s), req.settings.partition_count)),
                is_event: m.is_event,
                status: MessageStatus::STORED,
                attempts: 0,
                instance_id: None,
                lease_expiry: None,
                error: None,
                failure_reason: None,
                scheduled_for: m.scheduled_for,
                created_at,
            };

            if m.is_event {
                match m.stream_id.as_deref() {
                    None => {
                        let err = CoordinationError::Validation(
                            "event message without stream_id".to_string(),
                        );
                        errors.push(WorkBatchError::new(m.message_id, &err));
                        row.status |= MessageStatus::FAILED;
                        row.error = Some(err.to_string());
                        row.failure_reason = Some(err.reason().to_string());
                    }
                    Some(stream) => match state.append_event(
                        m.message_id,
                        stream,
                        &m.event_type,
                        &m.envelope_json,
                        m.scope_json.as_ref(),
                    ) {
                        Some(_) => row.status |= MessageStatus::EVENT_STORED,
                        None => {
                            let err = CoordinationError::OptimisticConcurrency {
                                stream_id: stream.to_string(),
                            };
                            errors.push(WorkBatchError::new(m.message_id, &err));
                            row.status |= MessageStatus::FAILED;
                            row.error = Some(err.to_string());
                            row.failure_reason = Some(err.reason().to_string());
                        }
                    },
                }
            }

            state.outbox.insert(m.message_id, row);
        }

        // 5. Ingest inbox; the dedup map is the exactly-once gate. It is
        // permanent, so a replay is rejected even after the inbox row
        // itself terminated and was deleted.
        for m in &req.new_inbox {
            if state.dedup.contains_key(&m.message_id) {
                continue;
            }
            let first_seen = state.now;
            state.dedup.insert(m.message_id, first_seen);
            new_ids.insert(m.message_id);
            let received_at = state.tick();
            let mut row = MemInboxRow {
                message_id: m.message_id,
                handler_name: m.handler_name.clone(),
                event_type: m.event_type.clone(),
                envelope_type: m.envelope_type.clone(),
                envelope_json: m.envelope_json.clone(),
                stream_id: m.stream_id.clone(),
                partition_number: m
                    .stream_id
                    .as_deref()
                    .map(|s| partition_for_stream(Some(s), req.settings.partition_count)),
                is_event: m.is_event,
                status: MessageStatus::STORED,
                attempts: 0,
                instance_id: None,
                lease_expiry: None,
                error: None,
                failure_reason: None,
                received_at,
                processed_at: None,
            };

            if m.is_event {
                match m.stream_id.as_deref() {
                    None => {
                        let err = CoordinationError::Validation(
                            "event message without stream_id".to_string(),
                        );
                        errors.push(WorkBatchError::new(m.message_id, &err));
                        row.status |= MessageStatus::FAILED;
                        row.error = Some(err.to_string());
                        row.failure_reason = Some(err.reason().to_string());
                    }
                    Some(stream) => match state.append_event(
                        m.message_id,
                        stream,
                        &m.event_type,
                        &m.envelope_json,
                        m.scope_json.as_ref(),
                    ) {
                        Some(_) => row.status |= MessageStatus::EVENT_STORED,
                        None => {
                            let err = CoordinationError::OptimisticConcurrency {
                                stream_id: stream.to_string(),
                            };
                            errors.push(WorkBatchError::new(m.message_id, &err));
                            row.status |= MessageStatus::FAILED;
                            row.error = Some(err.to_string());
                            row.failure_reason = Some(err.reason().to_string());
                        }
                    },
                }
            }

            state.inbox.insert(m.message_id, row);
        }

        // 6. Completions. Repeated reports are no-ops.
        for c in &req.outbox_completions {
            let remove = match state.outbox.get_mut(&c.message_id) {
                None => false,
                Some(row) => {
                    row.status |= c.status;
                    row.status.outbox_terminal() && !debug_mode
                }
            };
            if remove {
                state.outbox.remove(&c.message_id);
            }
        }
        for c in &req.inbox_completions {
            let now = state.now;
            let remove = match state.inbox.get_mut(&c.message_id) {
                None => false,
                Some(row) => {
                    row.status |= c.status;
                    if row.status.inbox_terminal(row.is_event) {
                        if debug_mode {
                            row.processed_at.get_or_insert(now);
                            false
                        } else {
                            true
                        }
                    } else {
                        false
                    }
                }
            };
            if remove {
                state.inbox.remove(&c.message_id);
            }
        }
        for r in &req.receptor_completions {
            state.receptor_processing.insert(
                (r.message_id, r.receptor_name.clone()),
                (r.succeeded, r.error.clone()),
            );
        }
        for c in &req.perspective_completions {
            Self::apply_checkpoint_completion(&mut state.checkpoints, c);
        }
        for f in &req.perspective_failures {
            Self::apply_checkpoint_failure(&mut state.checkpoints, f);
        }

        // 7. Failures.
        for f in &req.outbox_failures {
            let permanent = is_permanent_reason(&f.reason)
                || state
                    .outbox
                    .get(&f.message_id)
                    .is_some_and(|r| r.attempts + 1 >= req.settings.max_attempts);
            if let Some(row) = state.outbox.get_mut(&f.message_id) {
                row.status = if permanent {
                    f.completed | MessageStatus::FAILED
                } else {
                    f.completed
                };
                row.error = Some(f.error.clone());
                row.failure_reason = Some(if !is_permanent_reason(&f.reason) && permanent {
                    "MaxAttemptsExceeded".to_string()
                } else {
                    f.reason.clone()
                });
                row.attempts += 1;
                row.instance_id = None;
                row.lease_expiry = None;
            }
        }
        for f in &req.inbox_failures {
            let permanent = is_permanent_reason(&f.reason)
                || state
                    .inbox
                    .get(&f.message_id)
                    .is_some_and(|r| r.attempts + 1 >= req.settings.max_attempts);
            let cascade = match state.inbox.get_mut(&f.message_id) {
                None => None,
                Some(row) => {
                    row.status = if permanent {
                        f.completed | MessageStatus::FAILED
                    } else {
                        f.completed
                    };
                    row.error = Some(f.error.clone());
                    row.failure_reason = Some(if !is_permanent_reason(&f.reason) && permanent {
                        "MaxAttemptsExceeded".to_string()
                    } else {
                        f.reason.clone()
                    });
                    row.attempts += 1;
                    row.instance_id = None;
                    row.lease_expiry = None;
                    row.stream_id.clone().map(|s| (s, row.received_at, row.message_id))
                }
            };

            // Release later rows of the same stream still held by the
            // failing instance, so the next pass re-claims in order.
            if let Some((stream, received_at, message_id)) = cascade {
                let caller = req.instance.instance_id;
                for row in state.inbox.values_mut() {
                    if row.stream_id.as_deref() == Some(stream.as_str())
                        && (row.received_at, row.message_id) > (received_at, message_id)
                        && row.instance_id == Some(caller)
                    {
                        row.instance_id = None;
                        row.lease_expiry = None;
                    }
                }
            }
        }

        // 8. Lease renewal; silently skips ids the caller no longer owns.
        let renewed_until = state.now + Duration::seconds(req.settings.lease_seconds);
        for id in &req.renew_outbox {
            if let Some(row) = state.outbox.get_mut(id) {
                if row.instance_id == Some(req.instance.instance_id) {
                    row.lease_expiry = Some(renewed_until);
                }
            }
        }
        for id in &req.renew_inbox {
            if let Some(row) = state.inbox.get_mut(id) {
                if row.instance_id == Some(req.instance.instance_id) {
                    row.lease_expiry = Some(renewed_until);
                }
            }
        }

        // 9-11. Claim and return.
        if req.flags.contains(BatchFlags::SKIP_CLAIM) {
            return WorkBatch {
                outbox: Vec::new(),
                inbox: Vec::new(),
                perspectives: Vec::new(),
                errors,
                active_instances: active_count as i64,
            };
        }

        let outbox = Self::claim_outbox(&mut state, req, active_count, my_slot, &new_ids);
        let inbox = Self::claim_inbox(&mut state, req, active_count, my_slot, &new_ids);

        // Sticky stream ownership for claimed streams.
        let lease = state.now + Duration::seconds(req.settings.lease_seconds);
        let claimed_streams: Vec<(String, i32)> = outbox
            .iter()
            .filter_map(|w| w.stream_id.clone().zip(w.partition_number))
            .chain(
                inbox
                    .iter()
                    .filter_map(|w| w.stream_id.clone().zip(w.partition_number)),
            )
            .collect();
        for (stream, partition) in claimed_streams {
            state.active_streams.insert(
                stream,
                MemActiveStream {
                    partition_number: partition,
                    assigned_instance_id: Some(req.instance.instance_id),
                    lease_expiry: Some(lease),
                },
            );
        }

        let perspectives = Self::claim_perspectives(&state, req, active_count, my_slot);

        WorkBatch {
            outbox,
            inbox,
            perspectives,
            errors,
            active_instances: active_count as i64,
        }
    }

    fn apply_checkpoint_completion(
        checkpoints: &mut BTreeMap<(String, String), MemCheckpoint>,
        c: &PerspectiveCompletion,
    ) {
        checkpoints.insert(
            (c.stream_id.clone(), c.perspective_name.clone()),
            MemCheckpoint {
                last_event_id: Some(c.last_event_id),
                status: "active".to_string(),
                error: None,
            },
        );
    }

    fn apply_checkpoint_failure(
        checkpoints: &mut BTreeMap<(String, String), MemCheckpoint>,
        f: &PerspectiveFailure,
    ) {
        let detail = match f.failed_event_id {
            Some(id) => format!("{} (event {id})", f.error),
            None => f.error.clone(),
        };
        checkpoints
            .entry((f.stream_id.clone(), f.perspective_name.clone()))
            .and_modify(|c| {
                c.status = "failed".to_string();
                c.error = Some(detail.clone());
            })
            .or_insert(MemCheckpoint {
                last_event_id: None,
                status: "failed".to_string(),
                error: Some(detail),
            });
    }

    /// The shared claim predicate: eligible, owned by this slot, and not
    /// behind a blocked or foreign-held earlier row of its stream.
    fn stream_guard_blocks<'a, I>(earlier: I, caller: Uuid, now: DateTime<Utc>) -> bool
    where
        I: Iterator<Item = (&'a Option<Uuid>, &'a Option<DateTime<Utc>>, MessageStatus, i32)>,
    {
        for (instance_id, lease_expiry, status, attempts) in earlier {
            let held_elsewhere = instance_id
                .is_some_and(|i| i != caller && lease_expiry.is_some_and(|l| l >= now));
            if held_elsewhere || status.contains(MessageStatus::FAILED) || attempts > 0 {
                return true;
            }
        }
        false
    }

    fn claim_outbox(
        state: &mut State,
        req: &WorkBatchRequest,
        active_count: usize,
        my_slot: usize,
        new_ids: &HashSet<Uuid>,
    ) -> Vec<OutboxWork> {
        let now = state.now;
        let caller = req.instance.instance_id;

        let mut candidates: Vec<(DateTime<Utc>, Uuid, bool)> = Vec::new();
        for row in state.outbox.values() {
            if row.status.contains(MessageStatus::FAILED)
                || row.status.contains(MessageStatus::PUBLISHED)
            {
                continue;
            }
            if row.instance_id.is_some() && row.lease_expiry.is_some_and(|l| l >= now) {
                continue;
            }
            if row.scheduled_for.is_some_and(|s| s > now) {
                continue;
            }
            let key = row.stream_id.as_deref().unwrap_or("");
            if owner_slot(key, active_count) != my_slot {
                continue;
            }
            if let Some(stream) = row.stream_id.as_deref() {
                let earlier = state.outbox.values().filter(|e| {
                    e.stream_id.as_deref() == Some(stream)
                        && (e.created_at, e.message_id) < (row.created_at, row.message_id)
                        && !e.status.contains(MessageStatus::PUBLISHED)
                });
                if Self::stream_guard_blocks(
                    earlier.map(|e| (&e.instance_id, &e.lease_expiry, e.status, e.attempts)),
                    caller,
                    now,
                ) {
                    continue;
                }
            }
            candidates.push((row.created_at, row.message_id, row.instance_id.is_some()));
        }

        candidates.sort();
        candidates.truncate(req.settings.claim_batch_size as usize);

        let lease = now + Duration::seconds(req.settings.lease_seconds);
        let mut out = Vec::with_capacity(candidates.len());
        for (_, message_id, reclaimed) in candidates {
            let row = match state.outbox.get_mut(&message_id) {
                Some(row) => row,
                None => continue,
            };
            row.instance_id = Some(caller);
            row.lease_expiry = Some(lease);

            let mut flags = WorkItemFlags::empty();
            if new_ids.contains(&message_id) {
                flags |= WorkItemFlags::NEWLY_STORED;
            }
            if reclaimed {
                flags |= WorkItemFlags::ORPHANED;
            }
            out.push(OutboxWork {
                message_id,
                destination: row.destination.clone(),
                event_type: row.event_type.clone(),
                envelope_type: row.envelope_type.clone(),
                envelope_json: row.envelope_json.clone(),
                stream_id: row.stream_id.clone(),
                partition_number: row.partition_number,
                is_event: row.is_event,
                status: row.status,
                flags,
                attempts: row.attempts,
                sequence_order: row.created_at.timestamp_millis(),
            });
        }
        out
    }

    fn claim_inbox(
        state: &mut State,
        req: &WorkBatchRequest,
        active_count: usize,
        my_slot: usize,
        new_ids: &HashSet<Uuid>,
    ) -> Vec<InboxWork> {
        let now = state.now;
        let caller = req.instance.instance_id;

        let mut candidates: Vec<(DateTime<Utc>, Uuid, bool)> = Vec::new();
        for row in state.inbox.values() {
            if row.status.contains(MessageStatus::FAILED) || row.processed_at.is_some() {
                continue;
            }
            if row.instance_id.is_some() && row.lease_expiry.is_some_and(|l| l >= now) {
                continue;
            }
            let key = row.stream_id.as_deref().unwrap_or("");
            if owner_slot(key, active_count) != my_slot {
                continue;
            }
            if let Some(stream) = row.stream_id.as_deref() {
                let earlier = state.inbox.values().filter(|e| {
                    e.stream_id.as_deref() == Some(stream)
                        && (e.received_at, e.message_id) < (row.received_at, row.message_id)
                        && e.processed_at.is_none()
                });
                if Self::stream_guard_blocks(
                    earlier.map(|e| (&e.instance_id, &e.lease_expiry, e.status, e.attempts)),
                    caller,
                    now,
                ) {
                    continue;
                }
            }
            candidates.push((row.received_at, row.message_id, row.instance_id.is_some()));
        }

        candidates.sort();
        candidates.truncate(req.settings.claim_batch_size as usize);

        let lease = now + Duration::seconds(req.settings.lease_seconds);
        let mut out = Vec::with_capacity(candidates.len());
        for (_, message_id, reclaimed) in candidates {
            let row = match state.inbox.get_mut(&message_id) {
                Some(row) => row,
                None => continue,
            };
            row.instance_id = Some(caller);
            row.lease_expiry = Some(lease);

            let mut flags = WorkItemFlags::empty();
            if new_ids.contains(&message_id) {
                flags |= WorkItemFlags::NEWLY_STORED;
            }
            if reclaimed {
                flags |= WorkItemFlags::ORPHANED;
            }
            out.push(InboxWork {
                message_id,
                handler_name: row.handler_name.clone(),
                event_type: row.event_type.clone(),
                envelope_type: row.envelope_type.clone(),
                envelope_json: row.envelope_json.clone(),
                stream_id: row.stream_id.clone(),
                partition_number: row.partition_number,
                is_event: row.is_event,
                status: row.status,
                flags,
                attempts: row.attempts,
                sequence_order: row.received_at.timestamp_millis(),
            });
        }
        out
    }

    fn claim_perspectives(
        state: &State,
        req: &WorkBatchRequest,
        active_count: usize,
        my_slot: usize,
    ) -> Vec<PerspectiveWork> {
        let mut out = Vec::new();
        for ((stream, perspective), checkpoint) in &state.checkpoints {
            if checkpoint.status == "failed" {
                continue;
            }
            if owner_slot(stream, active_count) != my_slot {
                continue;
            }
            let has_new = state.events.iter().any(|e| {
                e.stream_id == *stream
                    && checkpoint.last_event_id.map_or(true, |last| e.event_id > last)
            });
            if !has_new {
                continue;
            }
            out.push(PerspectiveWork {
                stream_id: stream.clone(),
                perspective_name: perspective.clone(),
                last_event_id: checkpoint.last_event_id,
            });
            if out.len() as i64 >= req.settings.claim_batch_size {
                break;
            }
        }
        out
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn process_work_batch(
        &self,
        request: WorkBatchRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkBatch> {
        request.settings.validate()?;
        if cancel.is_cancelled() {
            bail!("work batch cancelled");
        }
        Ok(self.run_batch(&request))
    }

    async fn report_perspective_completion(
        &self,
        completion: &PerspectiveCompletion,
    ) -> Result<()> {
        let mut state = self.lock();
        Self::apply_checkpoint_completion(&mut state.checkpoints, completion);
        Ok(())
    }

    async fn report_perspective_failure(&self, failure: &PerspectiveFailure) -> Result<()> {
        let mut state = self.lock();
        Self::apply_checkpoint_failure(&mut state.checkpoints, failure);
        Ok(())
    }
}

#[async_trait]
impl EventStoreReader for MemoryCoordinator {
    async fn events_after(
        &self,
        stream_id: &str,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<StoredEvent>> {
        let mut out: Vec<StoredEvent> = self
            .lock()
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id)
            .filter(|e| after.map_or(true, |a| e.event_id > a))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.version);
        out.truncate(limit as usize);
        Ok(out)
    }
}

#[async_trait]
impl ReadinessProbe for MemoryCoordinator {
    async fn is_ready(&self) -> bool {
        true
    }
}
