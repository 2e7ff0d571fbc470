use thiserror::Error;

/// Errors crossing the engine boundary. Worker-internal failures never show
/// up here; they surface as state transitions plus `last_error`.
#[derive(Debug, Error)]
pub enum EngineError {
	/// Operator mistake: reported to the client, not logged as a daemon error.
	#[error("{0}")]
	Usage(String),

	#[error("unknown worker: {0}")]
	UnknownWorker(String),

	#[error("spawn failed: {0}")]
	Spawn(String),

	#[error("snapshot: {0}")]
	Snapshot(String),
}

impl EngineError {
	pub fn is_usage(&self) -> bool {
		matches!(self, EngineError::Usage(_) | EngineError::UnknownWorker(_))
	}
}
