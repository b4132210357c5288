//! Deterministic in-memory backend for tests and single-process setups.
//!
//! [`MemoryCoordinator`] implements the same contract as the Postgres
//! coordinator — all eleven steps, the stream-ordering guard, orphan
//! reclaim, dedup, cascades — against plain maps behind one lock, with a
//! virtual clock (`advance`) so lease-expiry scenarios need no sleeping.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - No randomness beyond the ids the caller brings.
//! - `BTreeMap` state, so iteration order is stable.
//! - `fail_next_append(stream)` injects one optimistic-concurrency
//!   conflict, standing in for the cross-instance race only a real
//!   database exhibits.

pub mod fixtures;
pub mod memory_coordinator;

pub use memory_coordinator::MemoryCoordinator;
