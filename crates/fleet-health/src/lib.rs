//! fleet-health: access point availability checks.
//!
//! An access point is usable when every GSE server accepts a TCP
//! connection on its io port and both package URLs serve
//! `setup_agent.sh`.
//!
//! ```text
//! AccessPointChecker::check
//!   ├── connect probe per server   ┐
//!   ├── download probe (inner url) ├─ JoinSet, bounded by a Semaphore
//!   └── download probe (outer url) ┘
//!        └── CheckReport { ok = AND of probes, logs }
//! ```

pub mod access_point;
pub mod checker;

pub use access_point::{AccessPoint, PortConfig, ServerAddr};
pub use checker::{AccessPointChecker, CheckReport, LogLevel, ProbeError, ProbeLog, ProbeResult};
