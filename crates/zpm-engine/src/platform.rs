//! Process termination and port freeing, POSIX flavor. The engine consumes
//! only `terminate`, `kill_hard`, `pid_alive`, and `free_port`.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Settle period after an escalated SIGKILL.
const HARD_KILL_SETTLE: Duration = Duration::from_secs(1);
/// Poll step for the signal-0 existence check that backs up the exit event.
const EXISTENCE_POLL: Duration = Duration::from_millis(250);
/// Settle period after freeing an occupied port.
const PORT_SETTLE: Duration = Duration::from_millis(800);

pub fn kill_soft(pid: u32) {
	let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

pub fn kill_hard(pid: u32) {
	let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

/// Signal-0 existence check.
pub fn pid_alive(pid: u32) -> bool {
	kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Graceful kill: SIGTERM, wait up to `timeout` for the exit event (or for
/// the process to vanish), then SIGKILL plus a short settle.
pub async fn terminate(pid: u32, exited: CancellationToken, timeout: Duration) {
	kill_soft(pid);
	if wait_exit(pid, &exited, timeout).await {
		return;
	}
	tracing::warn!(pid, "graceful kill timed out, escalating to SIGKILL");
	kill_hard(pid);
	wait_exit(pid, &exited, HARD_KILL_SETTLE).await;
}

/// True once the child's exit event fired or the pid no longer exists.
async fn wait_exit(pid: u32, exited: &CancellationToken, limit: Duration) -> bool {
	let deadline = Instant::now() + limit;
	loop {
		if exited.is_cancelled() || !pid_alive(pid) {
			return true;
		}
		let now = Instant::now();
		if now >= deadline {
			return false;
		}
		let step = EXISTENCE_POLL.min(deadline - now);
		tokio::select! {
			_ = exited.cancelled() => return true,
			_ = tokio::time::sleep(step) => {}
		}
	}
}

/// Best-effort kill of whatever is listening on `port`, then a settle pause
/// so the address is actually reusable. Failures are ignored; the spawn will
/// surface the real error if the port is still taken.
pub async fn free_port(port: u16) {
	if free_port_cmd(port).await {
		tracing::info!(port, "freed occupied port");
		tokio::time::sleep(PORT_SETTLE).await;
	}
}

#[cfg(target_os = "macos")]
async fn free_port_cmd(port: u16) -> bool {
	let script = format!("lsof -ti tcp:{} | xargs kill -9", port);
	matches!(
		tokio::process::Command::new("sh")
			.args(["-c", &script])
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null())
			.status()
			.await,
		Ok(s) if s.success()
	)
}

#[cfg(not(target_os = "macos"))]
async fn free_port_cmd(port: u16) -> bool {
	matches!(
		tokio::process::Command::new("fuser")
			.args(["-k", "-n", "tcp", &port.to_string()])
			.stdout(std::process::Stdio::null())
			.stderr(std::process::Stdio::null())
			.status()
			.await,
		Ok(s) if s.success()
	)
}
