use std::time::Duration;

use zpm_core::types::{ProbeConfig, ProbeKind};

/// Single-shot liveness check. Any transport error or timeout counts as
/// dead; the worker accumulates failures, the probe never retries.
pub async fn probe_once(cfg: &ProbeConfig) -> bool {
	let limit = Duration::from_secs(cfg.timeout_secs.max(1));
	match cfg.kind {
		ProbeKind::Http => http_probe(&cfg.target, limit).await,
		ProbeKind::Tcp => tcp_probe(&cfg.target, limit).await,
		ProbeKind::Exec => exec_probe(&cfg.target, limit).await,
	}
}

/// Alive iff a response arrives with status < 500 before the timeout.
async fn http_probe(target: &str, limit: Duration) -> bool {
	let client = match reqwest::Client::builder().timeout(limit).build() {
		Ok(c) => c,
		Err(_) => return false,
	};
	match client.get(target).send().await {
		Ok(resp) => resp.status().as_u16() < 500,
		Err(_) => false,
	}
}

/// Alive iff the TCP handshake completes before the timeout.
async fn tcp_probe(target: &str, limit: Duration) -> bool {
	matches!(
		tokio::time::timeout(limit, tokio::net::TcpStream::connect(target)).await,
		Ok(Ok(_))
	)
}

/// Alive iff the command exits 0 before the timeout.
async fn exec_probe(target: &str, limit: Duration) -> bool {
	let run = tokio::process::Command::new("sh")
		.args(["-c", target])
		.stdin(std::process::Stdio::null())
		.stdout(std::process::Stdio::null())
		.stderr(std::process::Stdio::null())
		.status();
	matches!(tokio::time::timeout(limit, run).await, Ok(Ok(s)) if s.success())
}
