use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration of one managed worker. This is what the snapshot
/// file persists; unknown fields from older/newer versions are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
	pub name: String,
	pub script: PathBuf,
	#[serde(default)]
	pub args: Vec<String>,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default)]
	pub mode: Mode,
	/// Desired child count. Fork mode always runs 1; in cluster mode 0
	/// means "one per CPU".
	#[serde(default)]
	pub instances: u32,
	#[serde(default)]
	pub port: Option<u16>,
	#[serde(default)]
	pub dev_mode: bool,
	/// Left unset by clients to take the daemon's configured default; the
	/// supervisor fills it at registration.
	#[serde(default)]
	pub kill_timeout_ms: Option<u64>,
	#[serde(default)]
	pub max_backoff_ms: Option<u64>,
	#[serde(default)]
	pub probe: Option<ProbeConfig>,
	#[serde(default)]
	pub reload_command: Option<String>,
	#[serde(default)]
	pub log_sink: Option<LogSink>,
}

impl WorkerConfig {
	pub fn new(name: impl Into<String>, script: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			script: script.into(),
			args: Vec::new(),
			env: HashMap::new(),
			mode: Mode::Fork,
			instances: 1,
			port: None,
			dev_mode: false,
			kill_timeout_ms: None,
			max_backoff_ms: None,
			probe: None,
			reload_command: None,
			log_sink: None,
		}
	}

	/// Grace before a stuck child is hard-killed. The built-in fallback only
	/// applies to configs that never went through registration.
	pub fn kill_timeout(&self) -> Duration {
		Duration::from_millis(self.kill_timeout_ms.unwrap_or(5000))
	}

	pub fn max_backoff(&self) -> Duration {
		Duration::from_millis(self.max_backoff_ms.unwrap_or(16000))
	}

	/// Effective child count after applying the mode rules.
	pub fn child_count(&self) -> u32 {
		match self.mode {
			Mode::Fork => 1,
			Mode::Cluster if self.instances == 0 => std::thread::available_parallelism()
				.map(|n| n.get() as u32)
				.unwrap_or(1),
			Mode::Cluster => self.instances,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
	#[default]
	Fork,
	Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
	pub kind: ProbeKind,
	/// URL for http, `host:port` for tcp, shell command for exec.
	pub target: String,
	#[serde(default = "default_probe_interval")]
	pub interval_secs: u64,
	#[serde(default = "default_probe_timeout")]
	pub timeout_secs: u64,
	#[serde(default = "default_probe_failures")]
	pub failure_threshold: u32,
}

fn default_probe_interval() -> u64 {
	5
}
fn default_probe_timeout() -> u64 {
	3
}
fn default_probe_failures() -> u32 {
	3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
	Http,
	Tcp,
	Exec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSink {
	/// Append raw chunks to a file.
	File { target: PathBuf },
	/// Forward raw chunks over a TCP connection.
	Tcp { target: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
	#[default]
	Stopped,
	Starting,
	Running,
	Stopping,
	Crashed,
	Errored,
}

impl WorkerStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(self, WorkerStatus::Stopped | WorkerStatus::Crashed | WorkerStatus::Errored)
	}

	pub fn is_active(&self) -> bool {
		!self.is_terminal()
	}
}

impl std::fmt::Display for WorkerStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			WorkerStatus::Stopped => "stopped",
			WorkerStatus::Starting => "starting",
			WorkerStatus::Running => "running",
			WorkerStatus::Stopping => "stopping",
			WorkerStatus::Crashed => "crashed",
			WorkerStatus::Errored => "errored",
		};
		f.write_str(s)
	}
}

/// One row of `stats` output. Resource fields are `None` when the usage
/// query failed; that is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
	pub name: String,
	pub status: WorkerStatus,
	pub pid: Option<u32>,
	pub uptime_secs: Option<u64>,
	pub restart_count: u32,
	pub cpu_percent: Option<f32>,
	pub rss_bytes: Option<u64>,
	pub heap_bytes: Option<u64>,
	pub mode: Mode,
	pub instances: u32,
	#[serde(default)]
	pub last_error: Option<String>,
}

/// Raw per-worker record kept in the process store and returned verbatim by
/// `get-store`. Last writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
	pub name: String,
	pub status: WorkerStatus,
	pub pids: Vec<u32>,
	pub restart_count: u32,
	pub backoff_ms: u64,
	pub probe_failures: u32,
	pub is_restarting: bool,
	#[serde(default)]
	pub last_error: Option<String>,
}
