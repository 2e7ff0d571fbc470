use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use zpm_core::config::DefaultsConfig;
use zpm_core::types::{ProbeConfig, ProbeKind, WorkerConfig, WorkerStatus};
use zpm_engine::{Supervisor, SupervisorConfig};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

fn temp_dir(name: &str) -> PathBuf {
	let n = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
	let dir = std::env::temp_dir().join(format!("zpm-test-{}-{}-{}", std::process::id(), n, name));
	let _ = std::fs::create_dir_all(&dir);
	dir
}

fn write_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
	let path = dir.join(name);
	std::fs::write(&path, body).unwrap();
	path
}

fn test_supervisor(name: &str) -> (Arc<Supervisor>, PathBuf) {
	let dir = temp_dir(name);
	let sup = Supervisor::new(SupervisorConfig {
		echo: false,
		snapshot_path: dir.join("snapshot.json"),
		..Default::default()
	});
	(sup, dir)
}

fn config(name: &str, script: &std::path::Path) -> WorkerConfig {
	WorkerConfig::new(name, script)
}

async fn wait_for_status(sup: &Arc<Supervisor>, name: &str, want: WorkerStatus, limit: Duration) -> bool {
	let deadline = std::time::Instant::now() + limit;
	while std::time::Instant::now() < deadline {
		if let Ok(stats) = sup.stats(Some(name)).await {
			if stats[0].status == want {
				return true;
			}
		}
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	false
}

// --- Happy path ---

#[tokio::test]
async fn start_runs_and_stop_parks() {
	let (sup, dir) = test_supervisor("happy");
	let script = write_script(&dir, "echo.sh", "echo ready\nsleep 60\n");

	let msg = sup.start(config("api", &script)).await.unwrap();
	assert!(msg.contains("started"), "got: {}", msg);
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await);

	let stats = sup.stats(Some("api")).await.unwrap();
	assert_eq!(stats.len(), 1);
	assert!(stats[0].pid.unwrap() > 0);
	assert_eq!(stats[0].restart_count, 0);

	let msg = sup.stop("api").await.unwrap();
	assert!(msg.contains("stopped"), "got: {}", msg);
	let record = sup.store().get("api").unwrap();
	assert_eq!(record.status, WorkerStatus::Stopped);
	assert!(record.pids.is_empty());

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_is_idempotent() {
	let (sup, dir) = test_supervisor("stop-twice");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	sup.start(config("api", &script)).await.unwrap();
	wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await;

	sup.stop("api").await.unwrap();
	let msg = sup.stop("api").await.unwrap();
	assert!(msg.contains("already stopped"), "got: {}", msg);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn start_while_active_is_rejected() {
	let (sup, dir) = test_supervisor("double-start");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	sup.start(config("api", &script)).await.unwrap();
	wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await;

	let err = sup.start(config("api", &script)).await.unwrap_err();
	assert!(err.to_string().contains("already active"), "got: {}", err);
	assert!(err.is_usage());

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn unknown_worker_is_an_error() {
	let (sup, dir) = test_supervisor("unknown");
	assert!(sup.stop("ghost").await.is_err());
	assert!(sup.restart("ghost").await.is_err());
	assert!(sup.delete("ghost").await.is_err());
	assert!(sup.stats(Some("ghost")).await.is_err());
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Spawn failures ---

#[tokio::test]
async fn missing_script_goes_errored() {
	let (sup, dir) = test_supervisor("missing");
	let script = dir.join("does-not-exist.sh");

	// The IPC surface reports success; the error is visible in stats.
	let msg = sup.start(config("api", &script)).await.unwrap();
	assert!(msg.contains("errored"), "got: {}", msg);

	let stats = sup.stats(Some("api")).await.unwrap();
	assert_eq!(stats[0].status, WorkerStatus::Errored);
	assert!(stats[0].last_error.as_deref().unwrap().contains("script not found"));
	assert!(stats[0].pid.is_none());

	// A terminal worker can be started again once the script exists.
	write_script(&dir, "does-not-exist.sh", "sleep 60\n");
	sup.start(config("api", &script)).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await);

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Crash handling ---

#[tokio::test]
async fn crash_schedules_backoff_restarts() {
	let (sup, dir) = test_supervisor("crash-loop");
	let script = write_script(&dir, "crash.sh", "exit 1\n");

	sup.start(config("api", &script)).await.unwrap();

	// First crash lands within a few hundred ms; backoff is still the
	// initial 1000ms until the timer fires.
	assert!(wait_for_status(&sup, "api", WorkerStatus::Crashed, Duration::from_millis(800)).await);
	let record = sup.store().get("api").unwrap();
	assert_eq!(record.backoff_ms, 1000);
	assert!(record.last_error.as_deref().unwrap().contains("fast-fail"));

	// After the restart timer fires and the script crashes again, the count
	// is up and the backoff has doubled.
	tokio::time::sleep(Duration::from_millis(1600)).await;
	let record = sup.store().get("api").unwrap();
	assert!(record.restart_count >= 1, "restart_count: {}", record.restart_count);
	assert!(record.backoff_ms >= 2000, "backoff_ms: {}", record.backoff_ms);

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_cancels_pending_backoff_restart() {
	let (sup, dir) = test_supervisor("stop-backoff");
	let script = write_script(&dir, "crash.sh", "exit 1\n");

	sup.start(config("api", &script)).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Crashed, Duration::from_millis(800)).await);

	sup.stop("api").await.unwrap();
	// Past the point the backoff timer would have fired.
	tokio::time::sleep(Duration::from_millis(2500)).await;
	let record = sup.store().get("api").unwrap();
	assert_eq!(record.status, WorkerStatus::Stopped);
	assert!(record.pids.is_empty());

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn clean_exit_is_not_a_crash() {
	let (sup, dir) = test_supervisor("clean-exit");
	let script = write_script(&dir, "oneshot.sh", "echo done\n");

	sup.start(config("task", &script)).await.unwrap();
	assert!(wait_for_status(&sup, "task", WorkerStatus::Stopped, Duration::from_millis(800)).await);

	// No restart gets scheduled for a clean exit.
	tokio::time::sleep(Duration::from_millis(1500)).await;
	let record = sup.store().get("task").unwrap();
	assert_eq!(record.status, WorkerStatus::Stopped);
	assert_eq!(record.restart_count, 0);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stability_window_resets_backoff() {
	let (sup, dir) = test_supervisor("stability");
	// Crashes on the first run, sleeps on every run after that.
	let marker = dir.join("ran-once");
	let script = write_script(
		&dir,
		"flaky.sh",
		&format!("if [ -f {m} ]; then sleep 60; else touch {m}; exit 1; fi\n", m = marker.display()),
	);

	sup.start(config("api", &script)).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Crashed, Duration::from_millis(800)).await);

	// Backoff restart brings it up for good.
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(2000)).await);
	let record = sup.store().get("api").unwrap();
	assert_eq!(record.restart_count, 1);

	// After the 5s stability window both counters are back to initial.
	tokio::time::sleep(Duration::from_millis(5500)).await;
	let record = sup.store().get("api").unwrap();
	assert_eq!(record.status, WorkerStatus::Running);
	assert_eq!(record.restart_count, 0);
	assert_eq!(record.backoff_ms, 1000);

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Restart ---

#[tokio::test]
async fn restart_replaces_the_child() {
	let (sup, dir) = test_supervisor("restart-pid");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	sup.start(config("api", &script)).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await);
	let old_pid = sup.stats(Some("api")).await.unwrap()[0].pid.unwrap();

	sup.restart("api").await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_secs(2)).await);
	let stats = sup.stats(Some("api")).await.unwrap();
	assert_ne!(stats[0].pid.unwrap(), old_pid);
	assert_eq!(stats[0].restart_count, 1);

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Registry ---

#[tokio::test]
async fn list_keeps_registration_order() {
	let (sup, dir) = test_supervisor("order");
	let script = write_script(&dir, "oneshot.sh", "echo hi\n");

	sup.start(config("web", &script)).await.unwrap();
	sup.start(config("api", &script)).await.unwrap();
	sup.start(config("jobs", &script)).await.unwrap();
	assert_eq!(sup.list().await, vec!["web", "api", "jobs"]);

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn delete_removes_registry_and_store() {
	let (sup, dir) = test_supervisor("delete");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	sup.start(config("api", &script)).await.unwrap();
	wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await;

	sup.delete("api").await.unwrap();
	assert!(sup.list().await.is_empty());
	assert!(sup.store().get("api").is_none());

	// delete then start leaves the same observable state as a fresh start.
	sup.start(config("api", &script)).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await);
	assert_eq!(sup.list().await, vec!["api"]);
	let stats = sup.stats(Some("api")).await.unwrap();
	assert_eq!(stats[0].restart_count, 0);

	sup.stop_all().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stop_all_stops_everything() {
	let (sup, dir) = test_supervisor("stop-all");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	sup.start(config("one", &script)).await.unwrap();
	sup.start(config("two", &script)).await.unwrap();
	wait_for_status(&sup, "two", WorkerStatus::Running, Duration::from_millis(500)).await;

	sup.stop_all().await;
	for name in ["one", "two"] {
		let record = sup.store().get(name).unwrap();
		assert_eq!(record.status, WorkerStatus::Stopped, "{} not stopped", name);
		assert!(record.pids.is_empty());
	}

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Probe ---

#[tokio::test]
async fn failing_probe_triggers_restart() {
	let (sup, dir) = test_supervisor("probe");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	let mut cfg = config("api", &script);
	cfg.probe = Some(ProbeConfig {
		kind: ProbeKind::Exec,
		target: "false".to_string(),
		interval_secs: 1,
		timeout_secs: 1,
		failure_threshold: 2,
	});
	sup.start(cfg).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await);
	let old_pid = sup.stats(Some("api")).await.unwrap()[0].pid.unwrap();

	// Two failed ticks at ~1s each, then the restart.
	let deadline = std::time::Instant::now() + Duration::from_secs(6);
	let mut restarted = false;
	while std::time::Instant::now() < deadline {
		let stats = sup.stats(Some("api")).await.unwrap();
		if stats[0].restart_count >= 1 && stats[0].pid.is_some() && stats[0].pid != Some(old_pid) {
			restarted = true;
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert!(restarted, "probe did not trigger a restart");

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Dev-mode reload ---

#[tokio::test]
async fn dev_mode_reload_restarts_on_change() {
	let dir = temp_dir("dev-reload");
	let root = dir.join("app");
	let src = root.join("src");
	std::fs::create_dir_all(&src).unwrap();
	// The manifest pins the project root so the watcher covers `src/`.
	std::fs::write(root.join("package.json"), "{}").unwrap();
	let script = write_script(&root, "server.sh", "sleep 60\n");

	let sup = Supervisor::new(SupervisorConfig {
		echo: false,
		snapshot_path: dir.join("snapshot.json"),
		..Default::default()
	});
	let mut cfg = config("api", &script);
	cfg.dev_mode = true;
	sup.start(cfg).await.unwrap();
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_millis(500)).await);
	let old_pid = sup.stats(Some("api")).await.unwrap()[0].pid.unwrap();

	// Let the native watcher arm before the change lands.
	tokio::time::sleep(Duration::from_millis(300)).await;
	std::fs::write(src.join("index.js"), "// reloaded\n").unwrap();

	// No reload command, so the restart follows the 1.5s debounce window
	// directly; poll until the replacement child shows up.
	let deadline = std::time::Instant::now() + Duration::from_secs(6);
	let mut new_pid = None;
	while std::time::Instant::now() < deadline {
		let stats = sup.stats(Some("api")).await.unwrap();
		if stats[0].status == WorkerStatus::Running {
			if let Some(pid) = stats[0].pid {
				if pid != old_pid {
					new_pid = Some(pid);
					break;
				}
			}
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	assert!(new_pid.is_some(), "worker did not reload on file change");

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}

// --- Snapshot ---

#[tokio::test]
async fn snapshot_round_trips_configs() {
	let dir = temp_dir("snapshot");
	let snapshot_path = dir.join("snapshot.json");
	let script = write_script(&dir, "sleep.sh", "sleep 60\n");

	{
		let sup = Supervisor::new(SupervisorConfig {
			echo: false,
			snapshot_path: snapshot_path.clone(),
			..Default::default()
		});
		let mut cfg = config("api", &script);
		cfg.env.insert("API_KEY".to_string(), "sekrit".to_string());
		sup.start(cfg).await.unwrap();
		sup.start(config("web", &script)).await.unwrap();
		wait_for_status(&sup, "web", WorkerStatus::Running, Duration::from_millis(500)).await;
		sup.stop_all().await;
	}

	let saved: Vec<WorkerConfig> =
		serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
	assert_eq!(saved.len(), 2);
	assert_eq!(saved[0].name, "api");
	assert_eq!(saved[0].env.get("API_KEY").unwrap(), "sekrit");

	// A fresh supervisor resurrects both workers from the snapshot.
	let sup = Supervisor::new(SupervisorConfig {
		echo: false,
		snapshot_path: snapshot_path.clone(),
		..Default::default()
	});
	assert_eq!(sup.restore_snapshot().await, 2);
	assert_eq!(sup.list().await, vec!["api", "web"]);
	assert!(wait_for_status(&sup, "api", WorkerStatus::Running, Duration::from_secs(1)).await);
	assert!(wait_for_status(&sup, "web", WorkerStatus::Running, Duration::from_secs(1)).await);

	sup.stop_all().await;
	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn registration_fills_daemon_defaults() {
	let dir = temp_dir("defaults");
	let snapshot_path = dir.join("snapshot.json");
	let script = write_script(&dir, "oneshot.sh", "echo hi\n");

	let sup = Supervisor::new(SupervisorConfig {
		echo: false,
		snapshot_path: snapshot_path.clone(),
		defaults: DefaultsConfig {
			kill_timeout_ms: 1234,
			max_backoff_ms: 4096,
		},
	});

	// A config submitted with both fields unset, as a foreign client would.
	sup.start(config("api", &script)).await.unwrap();
	let saved: Vec<WorkerConfig> =
		serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
	assert_eq!(saved[0].kill_timeout_ms, Some(1234));
	assert_eq!(saved[0].max_backoff_ms, Some(4096));

	// An explicit value wins over the daemon default.
	let mut cfg = config("web", &script);
	cfg.kill_timeout_ms = Some(250);
	sup.start(cfg).await.unwrap();
	let saved: Vec<WorkerConfig> =
		serde_json::from_str(&std::fs::read_to_string(&snapshot_path).unwrap()).unwrap();
	assert_eq!(saved[1].kill_timeout_ms, Some(250));
	assert_eq!(saved[1].max_backoff_ms, Some(4096));

	let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn restore_skips_unreadable_snapshot() {
	let dir = temp_dir("bad-snapshot");
	let snapshot_path = dir.join("snapshot.json");
	std::fs::write(&snapshot_path, "not json {").unwrap();

	let sup = Supervisor::new(SupervisorConfig {
		echo: false,
		snapshot_path,
		..Default::default()
	});
	assert_eq!(sup.restore_snapshot().await, 0);
	assert!(sup.list().await.is_empty());

	let _ = std::fs::remove_dir_all(&dir);
}

// --- Output ---

#[tokio::test]
async fn child_output_reaches_subscribers() {
	let (sup, dir) = test_supervisor("output");
	let script = write_script(&dir, "chatty.sh", "while true; do echo hello-zpm; sleep 0.2; done\n");

	sup.start(config("api", &script)).await.unwrap();
	let mut targets = sup.logs_targets(Some("api")).await.unwrap();
	let (_, mut rx) = targets.remove(0);

	let chunk = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
	match chunk {
		Ok(Ok(bytes)) => {
			assert!(String::from_utf8_lossy(&bytes).contains("hello-zpm"));
		}
		other => panic!("no output chunk: {:?}", other),
	}

	sup.stop("api").await.unwrap();
	let _ = std::fs::remove_dir_all(&dir);
}
