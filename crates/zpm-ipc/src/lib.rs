//! The zpm control plane: local-socket server, synchronous client, and the
//! daemon bootstrap that wires both to the supervision engine.

pub mod client;
pub mod daemon;
pub mod server;

pub use client::{Client, ClientError};
