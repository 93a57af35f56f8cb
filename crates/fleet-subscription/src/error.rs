//! Subscription error types.

use fleet_state::{RowId, StateError};
use thiserror::Error;

/// Errors raised by subscription, task and instance record operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("step {step_id:?} not found in instance record {record_id}")]
    StepNotFound { record_id: RowId, step_id: String },

    #[error("step {step_id:?}: field `{field}` cannot be changed once initialised")]
    ImmutableStepField { step_id: String, field: &'static str },

    #[error("instance record {0} already has steps; reset them explicitly")]
    StepsAlreadyInitialized(RowId),

    #[error("instance record {0} has no process attached")]
    NoProcess(RowId),

    #[error("process {handle} failed to start: {message}")]
    Runner { handle: String, message: String },

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type SubscriptionResult<T> = Result<T, SubscriptionError>;
