//! Lifecycle invocation: eighteen named execution points around the
//! coordinator call and the transport/perspective stages.
//!
//! Async stages are fire-and-forget on a detached task and must never
//! influence the main flow; inline stages are awaited in registration order
//! and their failures abort the current unit of work.

pub mod invoker;
pub mod registry;
pub mod stage;

pub use invoker::LifecycleInvoker;
pub use registry::{LifecycleHandler, LifecycleRegistry, RegistrationId};
pub use stage::{LifecycleContext, LifecycleStage, MessageSource};
