//! Where and how a worker's script runs: interpreter selection, project
//! root discovery, and the child environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

const MANIFESTS: &[&str] = &["package.json", "Cargo.toml", "pyproject.toml", "go.mod"];

/// Interpreter for recognized script extensions. Anything else is executed
/// directly.
pub fn interpreter_for(script: &Path) -> Option<&'static str> {
	match script.extension().and_then(|e| e.to_str()) {
		Some("js") | Some("mjs") | Some("cjs") => Some("node"),
		Some("py") => Some("python3"),
		Some("sh") => Some("sh"),
		_ => None,
	}
}

/// Walks upward from the script's directory until a project manifest is
/// found; falls back to the daemon's working directory.
pub fn project_root(script: &Path) -> PathBuf {
	let script = script.canonicalize().unwrap_or_else(|_| script.to_path_buf());
	if let Some(start) = script.parent() {
		for dir in start.ancestors() {
			if MANIFESTS.iter().any(|m| dir.join(m).is_file()) {
				return dir.to_path_buf();
			}
		}
	}
	std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Daemon env merged with the worker env, deployment mode from `dev_mode`,
/// and the project's tool-bin directory prepended to PATH when present.
pub fn child_env(root: &Path, extra: &HashMap<String, String>, dev_mode: bool) -> HashMap<String, String> {
	let mut env: HashMap<String, String> = std::env::vars().collect();
	let deploy = if dev_mode { "development" } else { "production" };
	env.insert("NODE_ENV".to_string(), deploy.to_string());
	env.insert("ZPM_ENV".to_string(), deploy.to_string());

	let tool_bin = root.join("node_modules").join(".bin");
	if tool_bin.is_dir() {
		let path = env.get("PATH").cloned().unwrap_or_default();
		env.insert("PATH".to_string(), format!("{}:{}", tool_bin.display(), path));
	}

	for (key, val) in extra {
		env.insert(key.clone(), val.clone());
	}
	env
}
