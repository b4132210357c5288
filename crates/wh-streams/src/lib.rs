//! Ordered stream processing.
//!
//! Groups claimed work by stream, sorts by sequence order, and dispatches
//! strictly sequentially within each stream. Streams themselves may run
//! concurrently. The first failure in a stream stops the remainder of that
//! stream — the withheld items retry on a future batch, in order — while
//! other streams are unaffected.

use std::collections::BTreeMap;
use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use wh_schemas::{CompletionReport, FailureReport, InboxWork, MessageStatus, OutboxWork};

/// Work the processor can order: anything carrying a stream id and a
/// sequence position.
pub trait StreamWorkItem: Send {
    fn message_id(&self) -> Uuid;
    fn stream_id(&self) -> Option<&str>;
    fn sequence_order(&self) -> i64;
}

impl StreamWorkItem for OutboxWork {
    fn message_id(&self) -> Uuid {
        self.message_id
    }
    fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }
    fn sequence_order(&self) -> i64 {
        self.sequence_order
    }
}

impl StreamWorkItem for InboxWork {
    fn message_id(&self) -> Uuid {
        self.message_id
    }
    fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }
    fn sequence_order(&self) -> i64 {
        self.sequence_order
    }
}

/// What a processor function reports on failure: the stages that completed
/// before it, plus the error text.
#[derive(Debug, Clone)]
pub struct ProcessingFailure {
    pub completed: MessageStatus,
    pub error: String,
    /// Stable reason tag, see `CoordinationError::reason`.
    pub reason: String,
}

/// Per-item outcomes of one processing pass.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub succeeded: Vec<(Uuid, MessageStatus)>,
    pub failed: Vec<(Uuid, ProcessingFailure)>,
    /// Items withheld because an earlier item of their stream failed or the
    /// pass was cancelled. They stay claimed and retry after the lease.
    pub skipped: Vec<Uuid>,
}

impl ProcessReport {
    fn merge(&mut self, other: ProcessReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
    }

    /// Completion reports ready to queue on a flush strategy.
    pub fn completions(&self) -> Vec<CompletionReport> {
        self.succeeded
            .iter()
            .map(|(message_id, status)| CompletionReport {
                message_id: *message_id,
                status: *status,
            })
            .collect()
    }

    /// Failure reports ready to queue on a flush strategy.
    pub fn failures(&self) -> Vec<FailureReport> {
        self.failed
            .iter()
            .map(|(message_id, f)| FailureReport {
                message_id: *message_id,
                completed: f.completed,
                error: f.error.clone(),
                reason: f.reason.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StreamProcessor {
    /// Dispatch stream groups concurrently. Order within a stream is
    /// sequential either way.
    pub parallel_streams: bool,
}

impl StreamProcessor {
    pub fn new(parallel_streams: bool) -> Self {
        Self { parallel_streams }
    }

    /// Process one claimed batch. `handler` receives each item and returns
    /// the status mask it completed, or a [`ProcessingFailure`] carrying
    /// the pre-failure mask.
    ///
    /// Cancellation stops dispatching further items without interrupting
    /// the in-flight handler.
    pub async fn process<T, F, Fut>(
        &self,
        items: Vec<T>,
        handler: F,
        cancel: &CancellationToken,
    ) -> ProcessReport
    where
        T: StreamWorkItem + 'static,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<MessageStatus, ProcessingFailure>> + Send,
    {
        let mut groups: BTreeMap<Option<String>, Vec<T>> = BTreeMap::new();
        for item in items {
            groups
                .entry(item.stream_id().map(str::to_string))
                .or_default()
                .push(item);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|i| (i.sequence_order(), i.message_id()));
        }

        let mut report = ProcessReport::default();

        if self.parallel_streams {
            let mut set: JoinSet<ProcessReport> = JoinSet::new();
            for (stream, group) in groups {
                let handler = handler.clone();
                let cancel = cancel.clone();
                set.spawn(async move {
                    process_group(stream.as_deref(), group, handler, &cancel).await
                });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(group_report) => report.merge(group_report),
                    Err(err) => tracing::error!(error = %err, "stream group task panicked"),
                }
            }
        } else {
            for (stream, group) in groups {
                let group_report =
                    process_group(stream.as_deref(), group, handler.clone(), cancel).await;
                report.merge(group_report);
            }
        }

        report
    }
}

/// Strictly sequential within the group; stop on first failure.
async fn process_group<T, F, Fut>(
    stream: Option<&str>,
    group: Vec<T>,
    handler: F,
    cancel: &CancellationToken,
) -> ProcessReport
where
    T: StreamWorkItem,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<MessageStatus, ProcessingFailure>>,
{
    let mut report = ProcessReport::default();
    let mut iter = group.into_iter();

    while let Some(item) = iter.next() {
        if cancel.is_cancelled() {
            report.skipped.push(item.message_id());
            report.skipped.extend(iter.map(|i| i.message_id()));
            break;
        }

        let message_id = item.message_id();
        match handler(item).await {
            Ok(status) => report.succeeded.push((message_id, status)),
            Err(failure) => {
                tracing::debug!(
                    stream = stream.unwrap_or("<none>"),
                    message_id = %message_id,
                    error = %failure.error,
                    "stream stopped on failure; remainder withheld"
                );
                report.failed.push((message_id, failure));
                report.skipped.extend(iter.map(|i| i.message_id()));
                break;
            }
        }
    }

    report
}
