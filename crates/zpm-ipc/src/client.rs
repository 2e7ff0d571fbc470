//! Synchronous client side of the control socket, plus the helpers that
//! keep a daemon around: spawn-if-dead and PID-file kill.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::time::Duration;

use thiserror::Error;

use zpm_core::paths::{self, DaemonPaths};
use zpm_core::protocol::{Request, Response};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SPAWN_POLL: Duration = Duration::from_millis(200);
const SPAWN_DEADLINE: Duration = Duration::from_secs(8);

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("daemon not running")]
	NotRunning,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("bad response: {0}")]
	Protocol(String),
	#[error("daemon did not start in time")]
	SpawnTimeout,
}

/// One connection to the daemon. One request line in, one response line out;
/// `stream` keeps reading for the `logs` subscription.
pub struct Client {
	stream: UnixStream,
}

impl Client {
	pub fn connect(paths: &DaemonPaths) -> Result<Self, ClientError> {
		let stream = UnixStream::connect(paths.socket_path()).map_err(|_| ClientError::NotRunning)?;
		stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
		stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;
		Ok(Self { stream })
	}

	pub fn request(&mut self, request: &Request) -> Result<Response, ClientError> {
		self.send(request)?;
		let mut reader = BufReader::new(&self.stream);
		let mut line = String::new();
		reader.read_line(&mut line)?;
		if line.is_empty() {
			return Err(ClientError::Protocol("connection closed".to_string()));
		}
		serde_json::from_str(&line).map_err(|e| ClientError::Protocol(e.to_string()))
	}

	/// Sends one command and feeds every response line to `on_line` until
	/// the server closes or `on_line` returns false. Used for `logs`.
	pub fn stream(mut self, request: &Request, mut on_line: impl FnMut(Response) -> bool) -> Result<(), ClientError> {
		self.send(request)?;
		// Streams are open-ended; the per-read timeout no longer applies.
		self.stream.set_read_timeout(None)?;
		let mut reader = BufReader::new(&self.stream);
		loop {
			let mut line = String::new();
			let n = reader.read_line(&mut line)?;
			if n == 0 {
				return Ok(());
			}
			let response: Response =
				serde_json::from_str(&line).map_err(|e| ClientError::Protocol(e.to_string()))?;
			if !on_line(response) {
				return Ok(());
			}
		}
	}

	fn send(&mut self, request: &Request) -> Result<(), ClientError> {
		let mut data = serde_json::to_vec(request).map_err(|e| ClientError::Protocol(e.to_string()))?;
		data.push(b'\n');
		self.stream.write_all(&data)?;
		Ok(())
	}
}

pub fn ping(paths: &DaemonPaths) -> bool {
	match Client::connect(paths) {
		Ok(mut client) => matches!(client.request(&Request::Ping), Ok(resp) if resp.ok),
		Err(_) => false,
	}
}

/// Connects to the daemon, spawning it first if it is not running: the
/// current executable is relaunched detached as `daemon run`, with stdio
/// inherited in development so its output stays visible, and discarded in
/// production so the parent terminal can close.
pub fn ensure_daemon(paths: &DaemonPaths) -> Result<Client, ClientError> {
	if ping(paths) {
		return Client::connect(paths);
	}

	let exe = std::env::current_exe().unwrap_or_else(|_| "zpm".into());
	let mut cmd = std::process::Command::new(exe);
	cmd.args(["daemon", "run"]).stdin(std::process::Stdio::null());
	if paths::is_production() {
		cmd.stdout(std::process::Stdio::null()).stderr(std::process::Stdio::null());
	}
	cmd.process_group(0);
	cmd.spawn()?;

	let deadline = std::time::Instant::now() + SPAWN_DEADLINE;
	while std::time::Instant::now() < deadline {
		std::thread::sleep(SPAWN_POLL);
		if ping(paths) {
			return Client::connect(paths);
		}
	}
	Err(ClientError::SpawnTimeout)
}

pub fn read_pid(paths: &DaemonPaths) -> Option<u32> {
	std::fs::read_to_string(paths.pid_path())
		.ok()
		.and_then(|s| s.trim().parse().ok())
}

/// Soft-terminates the daemon via its PID file and unlinks the file.
pub fn kill_daemon(paths: &DaemonPaths) -> Result<u32, ClientError> {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;

	let pid = read_pid(paths).ok_or(ClientError::NotRunning)?;
	let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
	let _ = std::fs::remove_file(paths.pid_path());
	Ok(pid)
}
