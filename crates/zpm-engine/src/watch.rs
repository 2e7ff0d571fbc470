//! Dev-mode reload: recursively watch the project's `src` tree and restart
//! the worker when files settle, optionally running a rebuild command first.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, RecommendedCache};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::project;
use crate::worker::Worker;

/// Await-write-finish: a burst of writes must be quiet this long before one
/// reload fires.
const DEBOUNCE: Duration = Duration::from_millis(1500);
const DEBOUNCE_TICK: Duration = Duration::from_millis(500);

/// Keeps the native watcher and the reload task alive; dropping it tears
/// both down.
pub struct WatchGuard {
	_debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
	stop: CancellationToken,
}

impl Drop for WatchGuard {
	fn drop(&mut self) {
		self.stop.cancel();
	}
}

pub fn start(worker: Arc<Worker>) -> Option<WatchGuard> {
	let root = project::project_root(&worker.config.script);
	let src = root.join("src");
	let watch_dir = if src.is_dir() { src } else { root.clone() };

	let (tx, rx) = mpsc::channel::<()>(16);
	let name = worker.config.name.clone();
	let mut debouncer = match new_debouncer(DEBOUNCE, Some(DEBOUNCE_TICK), move |result: DebounceEventResult| {
		match result {
			Ok(events) => {
				let relevant = events.iter().any(|e| {
					matches!(e.event.kind, EventKind::Create(_) | EventKind::Modify(_))
						&& e.event.paths.iter().any(|p| !ignored(p))
				});
				if relevant {
					let _ = tx.try_send(());
				}
			}
			Err(errors) => {
				for error in errors {
					tracing::warn!(worker = %name, ?error, "file watcher error");
				}
			}
		}
	}) {
		Ok(d) => d,
		Err(e) => {
			tracing::error!(worker = %worker.config.name, error = %e, "failed to create file watcher");
			return None;
		}
	};

	if let Err(e) = debouncer.watch(&watch_dir, RecursiveMode::Recursive) {
		tracing::error!(worker = %worker.config.name, dir = %watch_dir.display(), error = %e, "failed to watch");
		return None;
	}
	tracing::info!(worker = %worker.config.name, dir = %watch_dir.display(), "watching for changes");

	let stop = CancellationToken::new();
	tokio::spawn(reload_loop(worker, root, rx, stop.clone()));

	Some(WatchGuard {
		_debouncer: debouncer,
		stop,
	})
}

async fn reload_loop(
	worker: Arc<Worker>,
	root: std::path::PathBuf,
	mut rx: mpsc::Receiver<()>,
	stop: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = stop.cancelled() => return,
			event = rx.recv() => {
				if event.is_none() {
					return;
				}
			}
		}

		tracing::info!(worker = %worker.config.name, "change detected");
		if let Some(command) = &worker.config.reload_command {
			if !run_reload_command(&worker, &root, command).await {
				drain(&mut rx);
				continue;
			}
		}
		worker.restart_for_reload(&stop).await;

		// Anything that queued while we were building or restarting is part
		// of the same change; one reload covers it.
		drain(&mut rx);
	}
}

async fn run_reload_command(worker: &Worker, root: &Path, command: &str) -> bool {
	tracing::info!(worker = %worker.config.name, command, "running reload command");
	let env = project::child_env(root, &worker.config.env, true);
	let status = tokio::process::Command::new("sh")
		.args(["-c", command])
		.current_dir(root)
		.env_clear()
		.envs(&env)
		.stdin(std::process::Stdio::null())
		.status()
		.await;
	match status {
		Ok(s) if s.success() => true,
		Ok(s) => {
			tracing::error!(worker = %worker.config.name, code = ?s.code(), "reload command failed, not restarting");
			false
		}
		Err(e) => {
			tracing::error!(worker = %worker.config.name, error = %e, "reload command did not run");
			false
		}
	}
}

fn drain(rx: &mut mpsc::Receiver<()>) {
	while rx.try_recv().is_ok() {}
}

fn ignored(path: &Path) -> bool {
	path.components().any(|c| c.as_os_str() == "node_modules")
		|| path.extension().and_then(|e| e.to_str()) == Some("pid")
}
