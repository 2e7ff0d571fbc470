use serde::Deserialize;

use crate::paths;

/// Daemon-level configuration from `~/.zpm/config.toml`. Every field has a
/// default; a missing or unparsable file never stops the daemon.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GlobalConfig {
	#[serde(default)]
	pub daemon: DaemonConfig,
	#[serde(default)]
	pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
	#[serde(default = "default_namespace")]
	pub namespace: String,
	/// Echo child output to the daemon's stdout even outside dev mode.
	#[serde(default)]
	pub echo: bool,
}

impl Default for DaemonConfig {
	fn default() -> Self {
		Self {
			namespace: default_namespace(),
			echo: false,
		}
	}
}

fn default_namespace() -> String {
	paths::DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
	#[serde(default = "default_kill_timeout")]
	pub kill_timeout_ms: u64,
	#[serde(default = "default_max_backoff")]
	pub max_backoff_ms: u64,
}

impl Default for DefaultsConfig {
	fn default() -> Self {
		Self {
			kill_timeout_ms: default_kill_timeout(),
			max_backoff_ms: default_max_backoff(),
		}
	}
}

fn default_kill_timeout() -> u64 {
	5000
}
fn default_max_backoff() -> u64 {
	16000
}

pub fn load_global_config() -> GlobalConfig {
	let path = paths::config_path();
	if path.exists() {
		match std::fs::read_to_string(&path) {
			Ok(content) => match toml::from_str(&content) {
				Ok(config) => return config,
				Err(e) => eprintln!("warning: failed to parse {}: {}", path.display(), e),
			},
			Err(e) => eprintln!("warning: failed to read {}: {}", path.display(), e),
		}
	}
	GlobalConfig::default()
}
