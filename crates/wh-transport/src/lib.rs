//! Bridge between the coordinator's output and the external broker.
//!
//! The transport contract tolerates arbitrary redelivery — exactly-once is
//! the coordinator's dedup, not the broker's problem. The publisher loop
//! consumes claimed outbox work and backs off while the transport reports
//! not-ready; the consumer loop turns deliveries into inbox queue calls.

pub mod consumer;
pub mod memory;
pub mod publisher;
pub mod transport;

pub use consumer::ConsumerLoop;
pub use memory::InMemoryTransport;
pub use publisher::PublisherLoop;
pub use transport::{MessageHeaders, Transport, TransportDelivery};
