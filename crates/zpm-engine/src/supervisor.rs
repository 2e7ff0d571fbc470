use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinSet;

use zpm_core::config::DefaultsConfig;
use zpm_core::paths;
use zpm_core::types::{StateRecord, WorkerConfig, WorkerStats};

use crate::error::EngineError;
use crate::stats::UsageSampler;
use crate::store::ProcessStore;
use crate::worker::Worker;

pub struct SupervisorConfig {
	/// Echo child output to the daemon's stdout regardless of dev mode.
	pub echo: bool,
	pub snapshot_path: PathBuf,
	/// Daemon-wide fallbacks for per-worker fields left unset by the client.
	pub defaults: DefaultsConfig,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			echo: false,
			snapshot_path: paths::snapshot_path(),
			defaults: DefaultsConfig::default(),
		}
	}
}

/// Top-level registry of workers, in registration order. Routes operator
/// commands, owns snapshot persistence, and shares one [`ProcessStore`]
/// across all workers.
pub struct Supervisor {
	workers: RwLock<Vec<Arc<Worker>>>,
	store: ProcessStore,
	sampler: UsageSampler,
	config: SupervisorConfig,
	snapshot_lock: Mutex<()>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig) -> Arc<Self> {
		Arc::new(Self {
			workers: RwLock::new(Vec::new()),
			store: ProcessStore::new(),
			sampler: UsageSampler::new(),
			config,
			snapshot_lock: Mutex::new(()),
		})
	}

	pub fn store(&self) -> &ProcessStore {
		&self.store
	}

	async fn find(&self, name: &str) -> Option<Arc<Worker>> {
		self.workers
			.read()
			.await
			.iter()
			.find(|w| w.config.name == name)
			.cloned()
	}

	/// Registers (or reuses a terminal) worker and starts it. The registered
	/// configuration wins on reuse; change it via `delete` + `start`.
	pub async fn start(self: &Arc<Self>, mut config: WorkerConfig) -> Result<String, EngineError> {
		if config.name.is_empty() {
			return Err(EngineError::Usage("worker name must not be empty".to_string()));
		}

		// Unset per-worker fields take the daemon-wide defaults here, so any
		// client on the wire honors them, not just the bundled CLI.
		config.kill_timeout_ms.get_or_insert(self.config.defaults.kill_timeout_ms);
		config.max_backoff_ms.get_or_insert(self.config.defaults.max_backoff_ms);

		// Find-or-register under the write lock, so two racing starts cannot
		// both insert the same name.
		let worker = {
			let mut workers = self.workers.write().await;
			let existing = workers.iter().find(|w| w.config.name == config.name).cloned();
			match existing {
				Some(existing) => {
					if existing.status().await.is_active() {
						return Err(EngineError::Usage(format!(
							"worker '{}' already active, use restart",
							config.name
						)));
					}
					existing
				}
				None => {
					let worker = Worker::new(config, self.store.clone(), self.config.echo);
					workers.push(Arc::clone(&worker));
					worker
				}
			}
		};

		let result = worker.start().await;
		self.persist().await;
		result
	}

	pub async fn stop(&self, name: &str) -> Result<String, EngineError> {
		let worker = self
			.find(name)
			.await
			.ok_or_else(|| EngineError::UnknownWorker(name.to_string()))?;
		let result = worker.stop().await;
		self.persist().await;
		result
	}

	pub async fn restart(&self, name: &str) -> Result<String, EngineError> {
		let worker = self
			.find(name)
			.await
			.ok_or_else(|| EngineError::UnknownWorker(name.to_string()))?;
		let result = worker.restart().await;
		self.persist().await;
		result
	}

	/// Drains the worker's children, then removes it from the registry and
	/// the store.
	pub async fn delete(&self, name: &str) -> Result<String, EngineError> {
		let worker = self
			.find(name)
			.await
			.ok_or_else(|| EngineError::UnknownWorker(name.to_string()))?;
		worker.stop().await?;
		self.workers.write().await.retain(|w| w.config.name != name);
		self.store.remove(name);
		self.persist().await;
		Ok(format!("{}: deleted", name))
	}

	pub async fn stats(&self, name: Option<&str>) -> Result<Vec<WorkerStats>, EngineError> {
		let workers: Vec<Arc<Worker>> = match name {
			Some(name) => vec![self
				.find(name)
				.await
				.ok_or_else(|| EngineError::UnknownWorker(name.to_string()))?],
			None => self.workers.read().await.clone(),
		};

		let mut stats = Vec::with_capacity(workers.len());
		for worker in workers {
			let snap = worker.stat_snapshot().await;
			let (cpu_percent, rss_bytes) = match snap.pid {
				Some(pid) => self.sampler.sample(pid),
				None => (None, None),
			};
			stats.push(WorkerStats {
				name: worker.config.name.clone(),
				status: snap.status,
				pid: snap.pid,
				uptime_secs: snap.uptime_secs,
				restart_count: snap.restart_count,
				cpu_percent,
				rss_bytes,
				heap_bytes: None,
				mode: worker.config.mode,
				instances: worker.config.child_count(),
				last_error: snap.last_error,
			});
		}
		Ok(stats)
	}

	/// Worker names in registration order.
	pub async fn list(&self) -> Vec<String> {
		self.workers
			.read()
			.await
			.iter()
			.map(|w| w.config.name.clone())
			.collect()
	}

	/// Stops every worker concurrently and waits for all of them.
	pub async fn stop_all(self: &Arc<Self>) {
		let workers: Vec<Arc<Worker>> = self.workers.read().await.clone();
		let mut set = JoinSet::new();
		for worker in workers {
			set.spawn(async move {
				if let Err(e) = worker.stop().await {
					tracing::warn!(worker = %worker.config.name, error = %e, "stop failed during shutdown");
				}
			});
		}
		while set.join_next().await.is_some() {}
	}

	/// Output subscriptions for the `logs` stream: the named worker, or all
	/// of them.
	pub async fn logs_targets(
		&self,
		name: Option<&str>,
	) -> Result<Vec<(String, broadcast::Receiver<Vec<u8>>)>, EngineError> {
		match name {
			Some(name) => {
				let worker = self
					.find(name)
					.await
					.ok_or_else(|| EngineError::UnknownWorker(name.to_string()))?;
				Ok(vec![(worker.config.name.clone(), worker.subscribe_output())])
			}
			None => Ok(self
				.workers
				.read()
				.await
				.iter()
				.map(|w| (w.config.name.clone(), w.subscribe_output()))
				.collect()),
		}
	}

	pub fn store_records(&self) -> Vec<StateRecord> {
		self.store.all()
	}

	// --- Snapshot persistence ---

	async fn persist(&self) {
		if let Err(e) = self.save_snapshot().await {
			tracing::error!(error = %e, "snapshot write failed");
		}
	}

	/// Atomically writes the registered configurations (not runtime state)
	/// as a JSON array. Concurrent writers serialize on `snapshot_lock`.
	pub async fn save_snapshot(&self) -> Result<(), EngineError> {
		let configs: Vec<WorkerConfig> = self
			.workers
			.read()
			.await
			.iter()
			.map(|w| w.config.clone())
			.collect();

		let _guard = self.snapshot_lock.lock().await;
		let path = &self.config.snapshot_path;
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).map_err(|e| EngineError::Snapshot(e.to_string()))?;
		}
		let json = serde_json::to_vec_pretty(&configs).map_err(|e| EngineError::Snapshot(e.to_string()))?;
		let tmp = path.with_extension("json.tmp");
		std::fs::write(&tmp, json).map_err(|e| EngineError::Snapshot(e.to_string()))?;
		std::fs::rename(&tmp, path).map_err(|e| EngineError::Snapshot(e.to_string()))?;
		Ok(())
	}

	/// Re-registers and starts every configuration in the snapshot file.
	/// Per-worker failures are logged and skipped. Returns the number of
	/// workers brought back.
	pub async fn restore_snapshot(self: &Arc<Self>) -> usize {
		let path = &self.config.snapshot_path;
		let content = match std::fs::read_to_string(path) {
			Ok(c) => c,
			Err(_) => return 0,
		};
		let configs: Vec<WorkerConfig> = match serde_json::from_str(&content) {
			Ok(c) => c,
			Err(e) => {
				tracing::error!(path = %path.display(), error = %e, "snapshot unreadable, skipping restore");
				return 0;
			}
		};

		let mut restored = 0;
		for config in configs {
			let name = config.name.clone();
			match self.start(config).await {
				Ok(_) => restored += 1,
				Err(e) => tracing::warn!(worker = %name, error = %e, "restore failed, skipping"),
			}
		}
		if restored > 0 {
			tracing::info!(restored, "restored workers from snapshot");
		}
		restored
	}
}
