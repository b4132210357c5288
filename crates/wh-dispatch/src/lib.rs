//! The dispatcher surface applications talk to.
//!
//! `send` buffers an outbound message and returns a receipt; `local_invoke`
//! is in-process request/reply; `publish` fans out to local receptors and
//! appends to the outbox. Handler wiring is an explicit registration table
//! — populated by generated code or user calls, never by runtime type
//! scanning.

pub mod dispatcher;
pub mod inbox;
pub mod receptors;
pub mod types;

pub use dispatcher::{DeliveryReceipt, Dispatcher, OutboundMessage};
pub use inbox::InboxProcessor;
pub use receptors::{NamedReceptor, Receptor, ReceptorContext, ReceptorRegistry};
pub use types::StaticTypeProvider;
