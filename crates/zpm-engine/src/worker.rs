//! One managed worker: spawns N child processes and drives the lifecycle
//! state machine across operator commands, child exits, backoff/stability
//! timers, liveness probes, and dev-mode reloads.
//!
//! Locking: `ops` serializes operator commands (start/stop/restart) for the
//! worker; `state` guards the mutable record and is the only lock event
//! handlers and timer tasks take. Commands hold `ops` across their whole
//! run but take `state` only for short, await-free sections, so a child
//! exit arriving mid-stop still gets classified against the already-updated
//! status.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use zpm_core::types::{StateRecord, WorkerConfig, WorkerStatus};

use crate::error::EngineError;
use crate::output::OutputHub;
use crate::platform;
use crate::probe;
use crate::project;
use crate::store::ProcessStore;
use crate::watch::{self, WatchGuard};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
const STABILITY_WINDOW: Duration = Duration::from_millis(5000);
const FAST_FAIL_UPTIME: Duration = Duration::from_millis(1500);
/// Hard bound on a stop operation, on top of the per-child kill timeout.
const STOP_SAFETY: Duration = Duration::from_secs(10);

pub struct Worker {
	pub config: WorkerConfig,
	ops: Mutex<()>,
	state: Mutex<WorkerState>,
	store: ProcessStore,
	hub: OutputHub,
	watcher: std::sync::Mutex<Option<WatchGuard>>,
}

struct WorkerState {
	status: WorkerStatus,
	children: Vec<ChildHandle>,
	started_at: Option<Instant>,
	restart_count: u32,
	backoff: Duration,
	probe_failures: u32,
	is_restarting: bool,
	last_error: Option<String>,
	restart_timer: Option<CancellationToken>,
	stability_timer: Option<CancellationToken>,
	probe_timer: Option<CancellationToken>,
}

struct ChildHandle {
	pid: u32,
	exited: CancellationToken,
}

/// Point-in-time view for the stats surface.
pub struct StatSnapshot {
	pub status: WorkerStatus,
	pub pid: Option<u32>,
	pub uptime_secs: Option<u64>,
	pub restart_count: u32,
	pub last_error: Option<String>,
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
	(current * 2).min(max)
}

impl Worker {
	pub fn new(config: WorkerConfig, store: ProcessStore, echo: bool) -> Arc<Self> {
		let hub = OutputHub::new(&config.name, echo || config.dev_mode, config.log_sink.as_ref());
		let worker = Arc::new(Self {
			config,
			ops: Mutex::new(()),
			state: Mutex::new(WorkerState {
				status: WorkerStatus::Stopped,
				children: Vec::new(),
				started_at: None,
				restart_count: 0,
				backoff: INITIAL_BACKOFF,
				probe_failures: 0,
				is_restarting: false,
				last_error: None,
				restart_timer: None,
				stability_timer: None,
				probe_timer: None,
			}),
			store,
			hub,
			watcher: std::sync::Mutex::new(None),
		});
		{
			// Make the worker visible in the store right away.
			let st = worker.state.try_lock().expect("fresh state");
			worker.publish(&st);
		}
		worker
	}

	pub async fn status(&self) -> WorkerStatus {
		self.state.lock().await.status
	}

	pub async fn stat_snapshot(&self) -> StatSnapshot {
		let st = self.state.lock().await;
		StatSnapshot {
			status: st.status,
			pid: st.children.first().map(|c| c.pid),
			uptime_secs: st.started_at.map(|t| t.elapsed().as_secs()),
			restart_count: st.restart_count,
			last_error: st.last_error.clone(),
		}
	}

	pub fn subscribe_output(&self) -> tokio::sync::broadcast::Receiver<Vec<u8>> {
		self.hub.subscribe()
	}

	// --- Operator commands ---

	pub async fn start(self: &Arc<Self>) -> Result<String, EngineError> {
		let _op = self.ops.lock().await;
		{
			let mut st = self.state.lock().await;
			if st.status.is_active() {
				return Err(EngineError::Usage(format!(
					"worker '{}' already active, use restart",
					self.config.name
				)));
			}
			clear_timers(&mut st);
			st.status = WorkerStatus::Starting;
			st.restart_count = 0;
			st.backoff = INITIAL_BACKOFF;
			st.probe_failures = 0;
			st.is_restarting = false;
			st.last_error = None;
			self.publish(&st);
		}
		tracing::info!(worker = %self.config.name, "starting");
		self.spawn_children().await;
		if self.config.dev_mode {
			self.start_watcher();
		}

		let st = self.state.lock().await;
		match st.status {
			WorkerStatus::Running => Ok(format!(
				"{}: started ({} child{})",
				self.config.name,
				st.children.len(),
				if st.children.len() == 1 { "" } else { "ren" }
			)),
			// Errors during start are surfaced through stats, not as an IPC
			// failure.
			_ => Ok(format!(
				"{}: {}{}",
				self.config.name,
				st.status,
				st.last_error
					.as_deref()
					.map(|e| format!(" ({})", e))
					.unwrap_or_default()
			)),
		}
	}

	pub async fn stop(self: &Arc<Self>) -> Result<String, EngineError> {
		let _op = self.ops.lock().await;
		self.stop_inner().await
	}

	pub async fn restart(self: &Arc<Self>) -> Result<String, EngineError> {
		let _op = self.ops.lock().await;
		self.restart_inner().await
	}

	/// Restart requested by the probe loop. Unlike the operator path this
	/// aborts silently if the worker left Running while the request was
	/// queued behind another command.
	async fn restart_for_probe(self: &Arc<Self>) {
		let _op = self.ops.lock().await;
		if self.state.lock().await.status != WorkerStatus::Running {
			return;
		}
		if let Err(e) = self.restart_inner().await {
			tracing::warn!(worker = %self.config.name, error = %e, "probe restart failed");
		}
	}

	/// Restart requested by the dev watcher. A stop may have raced the file
	/// event and torn the watcher down while this call waited its turn; the
	/// cancelled token keeps the reload from resurrecting a stopped worker.
	pub(crate) async fn restart_for_reload(self: &Arc<Self>, torn_down: &CancellationToken) {
		let _op = self.ops.lock().await;
		if torn_down.is_cancelled() {
			return;
		}
		let status = self.state.lock().await.status;
		if matches!(status, WorkerStatus::Stopped | WorkerStatus::Errored) {
			return;
		}
		if let Err(e) = self.restart_inner().await {
			tracing::warn!(worker = %self.config.name, error = %e, "reload restart failed");
		}
	}

	async fn stop_inner(self: &Arc<Self>) -> Result<String, EngineError> {
		self.stop_watcher();
		let targets: Vec<(u32, CancellationToken)> = {
			let mut st = self.state.lock().await;
			st.is_restarting = false;
			clear_timers(&mut st);
			if st.children.is_empty() {
				let already = st.status == WorkerStatus::Stopped;
				st.status = WorkerStatus::Stopped;
				st.started_at = None;
				self.publish(&st);
				return Ok(if already {
					format!("{}: already stopped", self.config.name)
				} else {
					format!("{}: stopped", self.config.name)
				});
			}
			st.status = WorkerStatus::Stopping;
			self.publish(&st);
			st.children.iter().map(|c| (c.pid, c.exited.clone())).collect()
		};

		tracing::info!(worker = %self.config.name, children = targets.len(), "stopping");
		let kill_timeout = self.config.kill_timeout();
		let mut set = JoinSet::new();
		for (pid, exited) in targets {
			set.spawn(platform::terminate(pid, exited, kill_timeout));
		}
		let drain = async {
			while set.join_next().await.is_some() {}
		};
		if tokio::time::timeout(STOP_SAFETY, drain).await.is_err() {
			tracing::warn!(worker = %self.config.name, "stop exceeded safety timeout, forcing");
		}

		let mut st = self.state.lock().await;
		for child in st.children.drain(..) {
			platform::kill_hard(child.pid);
		}
		clear_timers(&mut st);
		st.status = WorkerStatus::Stopped;
		st.started_at = None;
		self.publish(&st);
		Ok(format!("{}: stopped", self.config.name))
	}

	async fn restart_inner(self: &Arc<Self>) -> Result<String, EngineError> {
		let targets: Option<Vec<(u32, CancellationToken)>> = {
			let mut st = self.state.lock().await;
			cancel(&mut st.restart_timer);
			st.probe_failures = 0;
			st.restart_count += 1;
			if st.children.is_empty() {
				// Crashed with a pending backoff, or parked: skip the drain
				// and go straight back to spawn.
				st.status = WorkerStatus::Starting;
				st.last_error = None;
				self.publish(&st);
				None
			} else {
				st.is_restarting = true;
				st.status = WorkerStatus::Stopping;
				cancel(&mut st.stability_timer);
				cancel(&mut st.probe_timer);
				self.publish(&st);
				Some(st.children.iter().map(|c| (c.pid, c.exited.clone())).collect())
			}
		};

		tracing::info!(worker = %self.config.name, "restarting");
		match targets {
			None => self.spawn_children().await,
			Some(targets) => {
				let kill_timeout = self.config.kill_timeout();
				let mut set = JoinSet::new();
				for (pid, exited) in targets {
					set.spawn(platform::terminate(pid, exited, kill_timeout));
				}
				while set.join_next().await.is_some() {}

				// The respawn happens in the exit handler of the last child;
				// wait for it to take effect so a follow-up command observes
				// the restarted state.
				let deadline = Instant::now() + STOP_SAFETY;
				loop {
					{
						let st = self.state.lock().await;
						if !st.is_restarting && st.status != WorkerStatus::Stopping {
							break;
						}
					}
					if Instant::now() >= deadline {
						tracing::warn!(worker = %self.config.name, "restart did not settle in time");
						break;
					}
					tokio::time::sleep(Duration::from_millis(25)).await;
				}
			}
		}
		Ok(format!("{}: restarted", self.config.name))
	}

	// --- Spawning ---

	fn spawn_children<'a>(
		self: &'a Arc<Self>,
	) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
		Box::pin(self.spawn_children_inner())
	}

	async fn spawn_children_inner(self: &Arc<Self>) {
		let cfg = &self.config;
		if !cfg.script.exists() {
			let mut st = self.state.lock().await;
			st.status = WorkerStatus::Errored;
			st.started_at = None;
			st.last_error = Some(format!("script not found: {}", cfg.script.display()));
			clear_timers(&mut st);
			self.publish(&st);
			tracing::error!(worker = %cfg.name, script = %cfg.script.display(), "script not found");
			return;
		}

		if let Some(port) = cfg.port {
			platform::free_port(port).await;
		}

		let root = project::project_root(&cfg.script);
		let env = project::child_env(&root, &cfg.env, cfg.dev_mode);
		let count = cfg.child_count();
		let mut spawned = 0u32;
		for index in 0..count {
			match self.spawn_one(&root, &env, index).await {
				Ok(pid) => {
					spawned += 1;
					tracing::info!(worker = %cfg.name, pid, index, "child spawned");
				}
				Err(e) => {
					tracing::error!(worker = %cfg.name, index, error = %e, "spawn failed");
					let mut st = self.state.lock().await;
					st.last_error = Some(format!("spawn failed: {}", e));
				}
			}
		}

		let mut st = self.state.lock().await;
		if spawned == 0 {
			if st.status == WorkerStatus::Starting {
				st.status = WorkerStatus::Stopped;
				if st.last_error.is_none() {
					st.last_error = Some("spawn yielded no children".to_string());
				}
			}
			self.publish(&st);
			return;
		}
		if st.status != WorkerStatus::Starting {
			// A stop or crash overtook the spawn; whatever we just launched
			// must not outlive the decision.
			let late: Vec<ChildHandle> = st.children.drain(..).collect();
			self.publish(&st);
			drop(st);
			for child in late {
				platform::kill_hard(child.pid);
			}
			return;
		}
		st.status = WorkerStatus::Running;
		st.started_at = Some(Instant::now());
		self.arm_stability(&mut st);
		self.arm_probe(&mut st);
		self.publish(&st);
		tracing::info!(worker = %cfg.name, children = spawned, "running");
	}

	async fn spawn_one(
		self: &Arc<Self>,
		root: &Path,
		env: &HashMap<String, String>,
		index: u32,
	) -> Result<u32, String> {
		let cfg = &self.config;
		let mut cmd = match project::interpreter_for(&cfg.script) {
			Some(interpreter) => {
				let mut cmd = tokio::process::Command::new(interpreter);
				cmd.arg(&cfg.script);
				cmd
			}
			None => tokio::process::Command::new(&cfg.script),
		};
		cmd.args(&cfg.args)
			.current_dir(root)
			.env_clear()
			.envs(env)
			.env("ZPM_WORKER", &cfg.name)
			.env("ZPM_INSTANCE", index.to_string())
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);

		let mut child = cmd.spawn().map_err(|e| e.to_string())?;
		let pid = child.id().ok_or_else(|| "child had no pid".to_string())?;

		if let Some(stdout) = child.stdout.take() {
			let hub = self.hub.clone();
			tokio::spawn(async move { pipe_output(stdout, hub).await });
		}
		if let Some(stderr) = child.stderr.take() {
			let hub = self.hub.clone();
			tokio::spawn(async move { pipe_output(stderr, hub).await });
		}

		let exited = CancellationToken::new();
		{
			let mut st = self.state.lock().await;
			st.children.push(ChildHandle { pid, exited: exited.clone() });
		}

		let worker = Arc::clone(self);
		tokio::spawn(async move {
			let started = Instant::now();
			let status = child.wait().await;
			exited.cancel();
			let (code, signal) = match status {
				Ok(s) => (s.code(), s.signal()),
				Err(_) => (None, None),
			};
			worker.on_child_exit(pid, code, signal, started.elapsed()).await;
		});
		Ok(pid)
	}

	// --- Event handling ---

	async fn on_child_exit(self: &Arc<Self>, pid: u32, code: Option<i32>, signal: Option<i32>, uptime: Duration) {
		let mut st = self.state.lock().await;
		let before = st.children.len();
		st.children.retain(|c| c.pid != pid);
		if st.children.len() == before {
			// Already detached (force-cleared by stop, or a crashed set's
			// sibling); nothing left to decide.
			return;
		}
		tracing::debug!(worker = %self.config.name, pid, ?code, ?signal, uptime_ms = uptime.as_millis() as u64, "child exited");

		if st.is_restarting {
			if st.children.is_empty() {
				st.is_restarting = false;
				st.status = WorkerStatus::Starting;
				self.publish(&st);
				drop(st);
				self.spawn_children().await;
			} else {
				self.publish(&st);
			}
			return;
		}

		match st.status {
			WorkerStatus::Stopping
			| WorkerStatus::Stopped
			| WorkerStatus::Crashed
			| WorkerStatus::Errored => {
				// Intentional termination, or a sibling of an already-handled
				// crash.
				self.publish(&st);
				return;
			}
			WorkerStatus::Starting | WorkerStatus::Running => {}
		}

		match code {
			Some(code) if code != 0 => self.on_crash(st, code, uptime).await,
			_ => {
				// Clean exit or signal death: not a crash.
				if st.children.is_empty() {
					clear_timers(&mut st);
					st.status = WorkerStatus::Stopped;
					st.started_at = None;
					tracing::info!(worker = %self.config.name, ?signal, "all children exited, parking");
				}
				self.publish(&st);
			}
		}
	}

	async fn on_crash(self: &Arc<Self>, mut st: tokio::sync::MutexGuard<'_, WorkerState>, code: i32, uptime: Duration) {
		st.status = WorkerStatus::Crashed;
		st.started_at = None;
		cancel(&mut st.stability_timer);
		cancel(&mut st.probe_timer);

		if uptime < FAST_FAIL_UPTIME {
			st.last_error = Some(format!(
				"fast-fail: exited with code {} after {}ms",
				code,
				uptime.as_millis()
			));
			tracing::warn!(
				worker = %self.config.name,
				code,
				uptime_ms = uptime.as_millis() as u64,
				"crashed almost immediately (build or syntax error?), retrying anyway"
			);
		} else {
			st.last_error = Some(format!("exited with code {}", code));
		}

		// Detach surviving siblings so the whole set respawns together on
		// the timer; their exits are ignored from here on.
		let siblings: Vec<ChildHandle> = st.children.drain(..).collect();
		let delay = st.backoff;
		self.schedule_restart(&mut st);
		self.publish(&st);
		drop(st);

		tracing::warn!(worker = %self.config.name, code, retry_in_ms = delay.as_millis() as u64, "worker crashed");
		let kill_timeout = self.config.kill_timeout();
		for child in siblings {
			tokio::spawn(platform::terminate(child.pid, child.exited, kill_timeout));
		}
	}

	// --- Timers ---

	fn schedule_restart(self: &Arc<Self>, st: &mut WorkerState) {
		cancel(&mut st.restart_timer);
		let token = CancellationToken::new();
		st.restart_timer = Some(token.clone());
		let delay = st.backoff;
		let worker = Arc::clone(self);
		tokio::spawn(async move {
			tokio::select! {
				_ = token.cancelled() => return,
				_ = tokio::time::sleep(delay) => {}
			}
			worker.on_restart_timer(token).await;
		});
	}

	async fn on_restart_timer(self: &Arc<Self>, token: CancellationToken) {
		{
			let mut st = self.state.lock().await;
			// The token may have been replaced or cancelled while this task
			// waited for the lock.
			if token.is_cancelled() || st.status != WorkerStatus::Crashed {
				return;
			}
			st.restart_timer = None;
			st.restart_count += 1;
			st.backoff = next_backoff(st.backoff, self.config.max_backoff());
			st.status = WorkerStatus::Starting;
			self.publish(&st);
			tracing::info!(worker = %self.config.name, attempt = st.restart_count, "restarting after backoff");
		}
		self.spawn_children().await;
	}

	fn arm_stability(self: &Arc<Self>, st: &mut WorkerState) {
		cancel(&mut st.stability_timer);
		let token = CancellationToken::new();
		st.stability_timer = Some(token.clone());
		let worker = Arc::clone(self);
		tokio::spawn(async move {
			tokio::select! {
				_ = token.cancelled() => return,
				_ = tokio::time::sleep(STABILITY_WINDOW) => {}
			}
			let mut st = worker.state.lock().await;
			if token.is_cancelled() || st.status != WorkerStatus::Running {
				return;
			}
			st.stability_timer = None;
			st.backoff = INITIAL_BACKOFF;
			st.restart_count = 0;
			worker.publish(&st);
			tracing::debug!(worker = %worker.config.name, "stable, backoff reset");
		});
	}

	fn arm_probe(self: &Arc<Self>, st: &mut WorkerState) {
		cancel(&mut st.probe_timer);
		let Some(probe_cfg) = self.config.probe.clone() else {
			return;
		};
		let token = CancellationToken::new();
		st.probe_timer = Some(token.clone());
		let worker = Arc::clone(self);
		tokio::spawn(async move {
			let interval = Duration::from_secs(probe_cfg.interval_secs.max(1));
			loop {
				tokio::select! {
					_ = token.cancelled() => return,
					_ = tokio::time::sleep(interval) => {}
				}
				if worker.state.lock().await.status != WorkerStatus::Running {
					continue;
				}
				let alive = probe::probe_once(&probe_cfg).await;
				let trip = {
					let mut st = worker.state.lock().await;
					if token.is_cancelled() || st.status != WorkerStatus::Running {
						continue;
					}
					if alive {
						if st.probe_failures != 0 {
							st.probe_failures = 0;
							worker.publish(&st);
						}
						false
					} else {
						st.probe_failures += 1;
						tracing::warn!(
							worker = %worker.config.name,
							failures = st.probe_failures,
							threshold = probe_cfg.failure_threshold,
							"liveness probe failed"
						);
						let trip = st.probe_failures >= probe_cfg.failure_threshold;
						if trip {
							st.probe_failures = 0;
						}
						worker.publish(&st);
						trip
					}
				};
				if trip {
					tracing::warn!(worker = %worker.config.name, "probe threshold reached, restarting");
					worker.restart_for_probe().await;
				}
			}
		});
	}

	// --- Dev watcher ---

	fn start_watcher(self: &Arc<Self>) {
		let mut guard = self.watcher.lock().expect("watcher lock poisoned");
		if guard.is_none() {
			*guard = watch::start(Arc::clone(self));
		}
	}

	fn stop_watcher(&self) {
		self.watcher.lock().expect("watcher lock poisoned").take();
	}

	// --- Store ---

	fn publish(&self, st: &WorkerState) {
		self.store.put(StateRecord {
			name: self.config.name.clone(),
			status: st.status,
			pids: st.children.iter().map(|c| c.pid).collect(),
			restart_count: st.restart_count,
			backoff_ms: st.backoff.as_millis() as u64,
			probe_failures: st.probe_failures,
			is_restarting: st.is_restarting,
			last_error: st.last_error.clone(),
		});
	}
}

fn cancel(slot: &mut Option<CancellationToken>) {
	if let Some(token) = slot.take() {
		token.cancel();
	}
}

fn clear_timers(st: &mut WorkerState) {
	cancel(&mut st.restart_timer);
	cancel(&mut st.stability_timer);
	cancel(&mut st.probe_timer);
}

async fn pipe_output<R: tokio::io::AsyncRead + Unpin>(mut reader: R, hub: OutputHub) {
	let mut buf = [0u8; 4096];
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => hub.publish(&buf[..n]),
			Err(_) => break,
		}
	}
}
