use std::sync::Mutex;
use sysinfo::{ProcessesToUpdate, System};

/// Per-PID CPU/RSS queries backed by one long-lived [`System`]. CPU usage is
/// measured between consecutive refreshes, so the very first sample for a
/// pid reads low; stats callers poll, which is good enough.
pub struct UsageSampler {
	system: Mutex<System>,
}

impl Default for UsageSampler {
	fn default() -> Self {
		Self::new()
	}
}

impl UsageSampler {
	pub fn new() -> Self {
		Self {
			system: Mutex::new(System::new()),
		}
	}

	/// `(cpu_percent, rss_bytes)`; `None` fields when the query fails.
	pub fn sample(&self, pid: u32) -> (Option<f32>, Option<u64>) {
		let mut system = self.system.lock().expect("sampler lock poisoned");
		let pid = sysinfo::Pid::from_u32(pid);
		system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
		match system.process(pid) {
			Some(proc) => (Some(proc.cpu_usage()), Some(proc.memory())),
			None => (None, None),
		}
	}
}
