use std::path::PathBuf;

pub const DEFAULT_NAMESPACE: &str = "zuz-pm";

/// Well-known filesystem locations, derived from a namespace string so tests
/// and parallel installs can run side by side.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
	pub namespace: String,
}

impl Default for DaemonPaths {
	fn default() -> Self {
		Self::new(DEFAULT_NAMESPACE)
	}
}

impl DaemonPaths {
	pub fn new(namespace: impl Into<String>) -> Self {
		Self { namespace: namespace.into() }
	}

	pub fn socket_path(&self) -> PathBuf {
		temp_dir().join(format!("{}.sock", self.namespace))
	}

	pub fn pid_path(&self) -> PathBuf {
		temp_dir().join(format!("{}.pid", self.namespace))
	}
}

fn temp_dir() -> PathBuf {
	std::env::var("TMPDIR")
		.ok()
		.map(PathBuf::from)
		.unwrap_or_else(std::env::temp_dir)
}

pub fn state_dir() -> PathBuf {
	if let Some(home) = home_dir() {
		home.join(".zpm")
	} else {
		temp_dir().join(".zpm")
	}
}

pub fn snapshot_path() -> PathBuf {
	state_dir().join("snapshot.json")
}

pub fn config_path() -> PathBuf {
	state_dir().join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}

/// Deployment mode, NODE_ENV-style: anything but "production" counts as
/// development.
pub fn is_production() -> bool {
	let check = |v: Result<String, std::env::VarError>| matches!(v.as_deref(), Ok("production"));
	check(std::env::var("ZPM_ENV")) || check(std::env::var("NODE_ENV"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn socket_and_pid_share_namespace() {
		let paths = DaemonPaths::new("zpm-test");
		let sock = paths.socket_path();
		let pid = paths.pid_path();
		assert!(sock.to_str().unwrap().ends_with("zpm-test.sock"));
		assert!(pid.to_str().unwrap().ends_with("zpm-test.pid"));
		assert_eq!(sock.parent(), pid.parent());
	}

	#[test]
	fn default_namespace() {
		let paths = DaemonPaths::default();
		assert!(paths.socket_path().to_str().unwrap().ends_with("zuz-pm.sock"));
	}

	#[test]
	fn snapshot_under_state_dir() {
		assert!(snapshot_path().starts_with(state_dir()));
		assert!(snapshot_path().to_str().unwrap().ends_with("snapshot.json"));
	}
}
