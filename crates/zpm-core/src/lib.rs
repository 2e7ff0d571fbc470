//! Shared vocabulary for zpm: worker configuration, runtime status, wire
//! protocol, and well-known filesystem paths.

pub mod config;
pub mod paths;
pub mod protocol;
pub mod types;

pub use paths::DaemonPaths;
pub use protocol::{Request, Response};
pub use types::{Mode, ProbeConfig, ProbeKind, StateRecord, WorkerConfig, WorkerStats, WorkerStatus};
