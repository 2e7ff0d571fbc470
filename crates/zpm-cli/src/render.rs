use owo_colors::OwoColorize;

use zpm_core::types::{Mode, WorkerStats, WorkerStatus};

pub fn render_stats(stats: &[WorkerStats]) {
	if stats.is_empty() {
		eprintln!("no workers");
		return;
	}

	let name_width = stats.iter().map(|s| s.name.len()).max().unwrap_or(4).max(4);
	println!(
		"  {:<width$} {:<9} {:<7} {:<8} {:<4} {:<6} {:<9} {}",
		"name".bold(),
		"status".bold(),
		"pid".bold(),
		"uptime".bold(),
		"↺".bold(),
		"cpu".bold(),
		"mem".bold(),
		"mode".bold(),
		width = name_width
	);
	for s in stats {
		print_stat_line(s, name_width);
	}
}

fn print_stat_line(s: &WorkerStats, name_width: usize) {
	let (glyph, label) = match s.status {
		WorkerStatus::Running => ("●".green().to_string(), "running".green().to_string()),
		WorkerStatus::Starting => ("●".cyan().to_string(), "starting".cyan().to_string()),
		WorkerStatus::Stopping => ("●".yellow().to_string(), "stopping".yellow().to_string()),
		WorkerStatus::Stopped => ("○".dimmed().to_string(), "stopped".dimmed().to_string()),
		WorkerStatus::Crashed => ("●".yellow().to_string(), "crashed".yellow().to_string()),
		WorkerStatus::Errored => ("●".red().to_string(), "errored".red().to_string()),
	};
	let pid = s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
	let uptime = s.uptime_secs.map(format_uptime).unwrap_or_else(|| "-".to_string());
	let cpu = s
		.cpu_percent
		.map(|c| format!("{:.1}%", c))
		.unwrap_or_else(|| "-".to_string());
	let mem = s.rss_bytes.map(format_bytes).unwrap_or_else(|| "-".to_string());
	let mode = match s.mode {
		Mode::Fork => "fork".to_string(),
		Mode::Cluster => format!("cluster×{}", s.instances),
	};

	println!(
		"{} {:<width$} {:<9} {:<7} {:<8} {:<4} {:<6} {:<9} {}",
		glyph,
		s.name,
		label,
		pid,
		uptime,
		s.restart_count,
		cpu,
		mem,
		mode,
		width = name_width
	);
	if let Some(err) = &s.last_error {
		println!("  {:<width$} {}", "", err.red(), width = name_width);
	}
}

pub fn format_uptime(secs: u64) -> String {
	match secs {
		s if s < 60 => format!("{}s", s),
		s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
		s if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
		s => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
	}
}

pub fn format_bytes(bytes: u64) -> String {
	const KB: u64 = 1024;
	const MB: u64 = KB * 1024;
	const GB: u64 = MB * 1024;
	match bytes {
		b if b < KB => format!("{} B", b),
		b if b < MB => format!("{:.1} KB", b as f64 / KB as f64),
		b if b < GB => format!("{:.1} MB", b as f64 / MB as f64),
		b => format!("{:.2} GB", b as f64 / GB as f64),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn uptime_buckets() {
		assert_eq!(format_uptime(42), "42s");
		assert_eq!(format_uptime(90), "1m 30s");
		assert_eq!(format_uptime(3700), "1h 1m");
		assert_eq!(format_uptime(90000), "1d 1h");
	}

	#[test]
	fn byte_buckets() {
		assert_eq!(format_bytes(512), "512 B");
		assert_eq!(format_bytes(2048), "2.0 KB");
		assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
	}
}
