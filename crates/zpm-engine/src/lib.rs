//! The zpm supervision engine: per-worker lifecycle state machine, crash
//! backoff, liveness probing, dev-mode reload, and the supervisor registry
//! that serializes operator commands against all of it.

pub mod error;
pub mod output;
pub mod platform;
pub mod probe;
pub mod project;
pub mod stats;
pub mod store;
pub mod supervisor;
pub mod watch;
pub mod worker;

pub use error::EngineError;
pub use store::{ProcessStore, StoreEvent};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::Worker;
