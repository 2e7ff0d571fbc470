//! Daemon bootstrap: PID file, stale socket cleanup, snapshot restore, the
//! control server, and signal-driven graceful shutdown.

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};

use zpm_core::config::{load_global_config, GlobalConfig};
use zpm_core::paths::{self, DaemonPaths};
use zpm_engine::{StoreEvent, Supervisor, SupervisorConfig};

use crate::server;

/// Runs the daemon until a termination signal. `Err` means a fatal boot
/// failure (socket bind or PID file); the caller exits non-zero.
pub async fn run() -> Result<(), String> {
	tracing_subscriber::fmt().init();
	let config = load_global_config();
	run_with(config).await
}

pub async fn run_with(config: GlobalConfig) -> Result<(), String> {
	let daemon_paths = DaemonPaths::new(&config.daemon.namespace);
	let supervisor = Supervisor::new(SupervisorConfig {
		echo: config.daemon.echo,
		snapshot_path: paths::snapshot_path(),
		defaults: config.defaults.clone(),
	});

	let pid_path = daemon_paths.pid_path();
	std::fs::write(&pid_path, std::process::id().to_string())
		.map_err(|e| format!("failed to write PID file {}: {}", pid_path.display(), e))?;

	let socket_path = daemon_paths.socket_path();
	if socket_path.exists() {
		let _ = std::fs::remove_file(&socket_path);
	}
	let listener = server::bind(&socket_path)
		.map_err(|e| format!("failed to bind {}: {}", socket_path.display(), e))?;

	spawn_store_observer(&supervisor);

	tracing::info!(pid = std::process::id(), socket = %socket_path.display(), "daemon started");
	supervisor.restore_snapshot().await;

	let server_supervisor = Arc::clone(&supervisor);
	let server_handle = tokio::spawn(async move {
		server::serve(server_supervisor, listener).await;
	});

	let mut sigterm = signal(SignalKind::terminate())
		.map_err(|e| format!("failed to install SIGTERM handler: {}", e))?;
	tokio::select! {
		_ = server_handle => {}
		_ = sigterm.recv() => {
			tracing::info!("SIGTERM, shutting down");
		}
		_ = tokio::signal::ctrl_c() => {
			tracing::info!("interrupt, shutting down");
		}
	}

	if let Err(e) = supervisor.save_snapshot().await {
		tracing::error!(error = %e, "snapshot write failed during shutdown");
	}
	supervisor.stop_all().await;

	let _ = std::fs::remove_file(&socket_path);
	let _ = std::fs::remove_file(&pid_path);
	Ok(())
}

/// Logs every store transition. Observers get copies off a broadcast
/// channel, so a busy store never waits on this task.
fn spawn_store_observer(supervisor: &Arc<Supervisor>) {
	let mut events = supervisor.store().subscribe();
	tokio::spawn(async move {
		loop {
			match events.recv().await {
				Ok(StoreEvent::Updated(record)) => {
					tracing::debug!(
						worker = %record.name,
						status = %record.status,
						pids = ?record.pids,
						restarts = record.restart_count,
						"state"
					);
				}
				Ok(StoreEvent::Removed(name)) => {
					tracing::debug!(worker = %name, "removed from store");
				}
				Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
				Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
			}
		}
	});
}
