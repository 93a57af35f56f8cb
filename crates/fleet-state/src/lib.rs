//! fleet-state: embedded state store for the fleet services.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for plugin packages, process controls, config templates, uploads,
//! export jobs, subscriptions and their instance records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{project}/{version}/{os}/{arch}`,
//! `{subscription_id}:{instance_id}`) back the uniqueness rules and allow
//! prefix scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across worker threads and async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod jobs;
pub mod packages;
pub mod store;
pub mod subscriptions;
pub mod tables;
pub mod templates;
pub mod types;

pub use error::{StateError, StateResult};
pub use packages::joined_checksums;
pub use store::{StateStore, epoch_secs};
pub use types::*;
