//! fleet-subscription: subscriptions and their per-instance execution ledger.
//!
//! A subscription declares which steps should run on which hosts or
//! services. Triggering it creates a task with one instance record per
//! target; each record carries the step ledger and the handle of the
//! process the external runner executes for it.
//!
//! # Components
//!
//! - **`service`**: create/query subscriptions, scope, triggering
//! - **`record`**: instance record step state machine and process handles
//! - **`runner`**: the [`ProcessRunner`] seam to the workflow engine
//! - **`cache`**: explicit per-subscription step cache

pub mod cache;
pub mod error;
pub mod record;
pub mod runner;
pub mod service;

#[cfg(test)]
mod testing;

pub use cache::StepCache;
pub use error::{SubscriptionError, SubscriptionResult};
pub use record::{StepPatch, simple_instance_info};
pub use runner::{Priority, ProcessRunner, RunOutcome};
pub use service::{
    Scope, SubscriptionService, SubscriptionSpec, SubscriptionWithSteps, TriggerRequest,
};
