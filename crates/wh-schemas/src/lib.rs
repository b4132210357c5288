//! Shared types and contracts for the wirehub coordination engine.
//!
//! Everything that crosses a crate boundary lives here: the message
//! envelope, status bitmasks, work-batch request/response DTOs, the
//! partition function, the exhaustive error kinds, and the async contracts
//! (`Coordinator`, `ReadinessProbe`, `EventStoreReader`) that the Postgres
//! and in-memory backends both implement.

pub mod contracts;
pub mod envelope;
pub mod error;
pub mod instance;
pub mod partition;
pub mod status;
pub mod work;

pub use contracts::{
    Coordinator, EventStoreReader, EventTypeProvider, ReadinessProbe, RequestResponseRecorder,
    TypeDescriptor,
};
pub use envelope::{Hop, MessageEnvelope};
pub use error::{CoordinationError, WorkBatchError};
pub use instance::ServiceInstance;
pub use partition::{fnv1a_64, owner_slot, partition_for_stream};
pub use status::{BatchFlags, MessageStatus, WorkItemFlags};
pub use work::{
    CompletionReport, CoordinationSettings, FailureReport, InboxWork, NewInboxMessage,
    NewOutboxMessage, OutboxWork, PerspectiveCompletion, PerspectiveFailure, PerspectiveWork,
    ReceptorCompletion, StoredEvent, WorkBatch, WorkBatchRequest,
};
