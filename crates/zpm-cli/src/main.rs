mod render;

use std::path::PathBuf;

use owo_colors::OwoColorize;

use zpm_core::config::load_global_config;
use zpm_core::paths::DaemonPaths;
use zpm_core::protocol::{Request, Response};
use zpm_core::types::{LogSink, Mode, ProbeConfig, ProbeKind, StateRecord, WorkerConfig, WorkerStats};
use zpm_ipc::client;

fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();

	if args.is_empty() {
		print_usage();
		return;
	}

	match args[0].as_str() {
		"help" | "--help" | "-h" => print_usage(),
		"version" | "--version" | "-V" => println!("zpm {}", env!("CARGO_PKG_VERSION")),
		"start" => cmd_start(&args[1..]),
		"stop" => cmd_routed(&args[1..], "stop", |name| Request::Stop { name }),
		"restart" => cmd_routed(&args[1..], "restart", |name| Request::Restart { name }),
		"delete" => cmd_routed(&args[1..], "delete", |name| Request::Delete { name }),
		"list" | "ls" => cmd_list(),
		"stats" | "st" => cmd_stats(&args[1..]),
		"logs" => cmd_logs(&args[1..]),
		"store" => cmd_store(),
		"ping" => cmd_ping(),
		"kill-daemon" => cmd_kill_daemon(),
		"daemon" => match args.get(1).map(|s| s.as_str()) {
			Some("run") => daemon_run(),
			_ => {
				eprintln!("usage: zpm daemon run");
				std::process::exit(1);
			}
		},
		other => {
			eprintln!("unknown command: {}", other);
			eprintln!("run 'zpm help' for usage");
			std::process::exit(1);
		}
	}
}

fn print_usage() {
	eprintln!("{} {} — process supervisor daemon", "zpm".bold(), env!("CARGO_PKG_VERSION"));
	eprintln!();
	eprintln!("usage: {} <command> [options]", "zpm".bold());
	eprintln!();

	eprintln!("{}", "workers".cyan().bold());
	eprintln!("  {} <script> [options]   Register and start a worker", "start".bold());
	eprintln!("  {} <name>                Stop a worker", "stop".bold());
	eprintln!("  {} <name>             Stop and start a worker", "restart".bold());
	eprintln!("  {} <name>              Stop and unregister a worker", "delete".bold());
	eprintln!();

	eprintln!("{}", "observe".cyan().bold());
	eprintln!("  {}                        Worker names", "list".bold());
	eprintln!("  {} [name]                Status, pid, uptime, cpu, memory", "stats".bold());
	eprintln!("  {} [name]                 Live output stream", "logs".bold());
	eprintln!("  {}                       Raw state records", "store".bold());
	eprintln!();

	eprintln!("{}", "daemon".cyan().bold());
	eprintln!("  {}                        Check the daemon is alive", "ping".bold());
	eprintln!("  {}                 Terminate the daemon", "kill-daemon".bold());
	eprintln!();

	eprintln!("{}", "start options".cyan().bold());
	eprintln!("  --name N          worker name (default: script file stem)");
	eprintln!("  --port P          free this port before each spawn");
	eprintln!("  --instances N     children in cluster mode (0 = one per CPU)");
	eprintln!("  --cluster         spawn N siblings instead of one child");
	eprintln!("  --dev             dev mode: echo output, watch src/ and reload");
	eprintln!("  --args \"...\"      arguments passed to the script");
	eprintln!("  --env K=V         extra child environment (repeatable)");
	eprintln!("  --reload-cmd CMD  build command run before a dev reload");
	eprintln!("  --log-file PATH   forward output to a file");
	eprintln!("  --log-tcp ADDR    forward output to host:port");
	eprintln!("  --probe-type T    liveness probe: http, tcp, or exec");
	eprintln!("  --probe-target T  URL, host:port, or shell command");
	eprintln!("  --probe-interval S / --probe-timeout S / --probe-failures N");
}

fn daemon_run() {
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime");
	if let Err(e) = runtime.block_on(zpm_ipc::daemon::run()) {
		eprintln!("fatal: {}", e);
		std::process::exit(1);
	}
}

fn daemon_paths() -> DaemonPaths {
	DaemonPaths::new(&load_global_config().daemon.namespace)
}

fn send_request(request: &Request) -> Response {
	let paths = daemon_paths();
	let mut client = match client::ensure_daemon(&paths) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	};
	match client.request(request) {
		Ok(resp) => resp,
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	}
}

/// Prints the daemon's human string, or the error with exit 1.
fn finish(response: Response) {
	if response.ok {
		if let Some(data) = response.data {
			match data.as_str() {
				Some(text) => println!("{}", text),
				None => println!("{}", data),
			}
		}
	} else {
		eprintln!("error: {}", response.error.unwrap_or_else(|| "unknown".to_string()));
		std::process::exit(1);
	}
}

fn cmd_routed(args: &[String], verb: &str, build: fn(String) -> Request) {
	let Some(name) = args.first() else {
		eprintln!("usage: zpm {} <name>", verb);
		std::process::exit(1);
	};
	finish(send_request(&build(name.clone())));
}

fn cmd_start(args: &[String]) {
	let config = match parse_start_args(args) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("error: {}", e);
			eprintln!("usage: zpm start <script> [options]");
			std::process::exit(1);
		}
	};
	let request = Request::Start {
		name: config.name.clone(),
		config,
	};
	finish(send_request(&request));
}

fn cmd_list() {
	let response = send_request(&Request::List);
	if !response.ok {
		eprintln!("error: {}", response.error.unwrap_or_default());
		std::process::exit(1);
	}
	let names: Vec<String> = response
		.data
		.and_then(|d| serde_json::from_value(d).ok())
		.unwrap_or_default();
	for name in names {
		println!("{}", name);
	}
}

fn cmd_stats(args: &[String]) {
	let response = send_request(&Request::Stats {
		name: args.first().cloned(),
	});
	if !response.ok {
		eprintln!("error: {}", response.error.unwrap_or_default());
		std::process::exit(1);
	}
	let stats: Vec<WorkerStats> = response
		.data
		.and_then(|d| serde_json::from_value(d).ok())
		.unwrap_or_default();
	render::render_stats(&stats);
}

fn cmd_store() {
	let response = send_request(&Request::GetStore);
	if !response.ok {
		eprintln!("error: {}", response.error.unwrap_or_default());
		std::process::exit(1);
	}
	let records: Vec<StateRecord> = response
		.data
		.and_then(|d| serde_json::from_value(d).ok())
		.unwrap_or_default();
	match serde_json::to_string_pretty(&records) {
		Ok(json) => println!("{}", json),
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	}
}

fn cmd_logs(args: &[String]) {
	let paths = daemon_paths();
	let client = match client::ensure_daemon(&paths) {
		Ok(c) => c,
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	};
	let request = Request::Logs {
		name: args.first().cloned(),
	};
	let result = client.stream(&request, |response| {
		if !response.ok {
			eprintln!("error: {}", response.error.unwrap_or_default());
			return false;
		}
		if let Some(text) = response.data.as_ref().and_then(|d| d.as_str()) {
			print!("{}", text);
			if !text.ends_with('\n') {
				println!();
			}
			use std::io::Write;
			let _ = std::io::stdout().flush();
		}
		true
	});
	if let Err(e) = result {
		eprintln!("error: {}", e);
		std::process::exit(1);
	}
}

fn cmd_ping() {
	if client::ping(&daemon_paths()) {
		println!("pong");
	} else {
		eprintln!("daemon not running");
		std::process::exit(1);
	}
}

fn cmd_kill_daemon() {
	match client::kill_daemon(&daemon_paths()) {
		Ok(pid) => println!("killed daemon (pid {})", pid),
		Err(e) => {
			eprintln!("error: {}", e);
			std::process::exit(1);
		}
	}
}

fn parse_start_args(args: &[String]) -> Result<WorkerConfig, String> {
	let mut script: Option<PathBuf> = None;
	let mut config_name: Option<String> = None;
	let mut port: Option<u16> = None;
	let mut instances: Option<u32> = None;
	let mut cluster = false;
	let mut dev = false;
	let mut script_args: Vec<String> = Vec::new();
	let mut env = std::collections::HashMap::new();
	let mut reload_command = None;
	let mut log_sink: Option<LogSink> = None;
	let mut probe_kind: Option<ProbeKind> = None;
	let mut probe_target: Option<String> = None;
	let mut probe_interval: Option<u64> = None;
	let mut probe_timeout: Option<u64> = None;
	let mut probe_failures: Option<u32> = None;

	let mut iter = args.iter();
	while let Some(arg) = iter.next() {
		let mut value = |flag: &str| {
			iter.next()
				.cloned()
				.ok_or_else(|| format!("{} needs a value", flag))
		};
		match arg.as_str() {
			"--name" => config_name = Some(value("--name")?),
			"--port" => port = Some(value("--port")?.parse().map_err(|_| "--port must be a port number")?),
			"--instances" => {
				instances = Some(value("--instances")?.parse().map_err(|_| "--instances must be a number")?)
			}
			"--cluster" => cluster = true,
			"--dev" => dev = true,
			"--args" => script_args.extend(value("--args")?.split_whitespace().map(String::from)),
			"--env" => {
				let pair = value("--env")?;
				let (key, val) = pair
					.split_once('=')
					.ok_or_else(|| format!("--env expects KEY=VALUE, got '{}'", pair))?;
				env.insert(key.to_string(), val.to_string());
			}
			"--reload-cmd" => reload_command = Some(value("--reload-cmd")?),
			"--log-file" => log_sink = Some(LogSink::File { target: value("--log-file")?.into() }),
			"--log-tcp" => log_sink = Some(LogSink::Tcp { target: value("--log-tcp")? }),
			"--probe-type" => {
				probe_kind = Some(match value("--probe-type")?.as_str() {
					"http" => ProbeKind::Http,
					"tcp" => ProbeKind::Tcp,
					"exec" => ProbeKind::Exec,
					other => return Err(format!("unknown probe type: {}", other)),
				})
			}
			"--probe-target" => probe_target = Some(value("--probe-target")?),
			"--probe-interval" => {
				probe_interval =
					Some(value("--probe-interval")?.parse().map_err(|_| "--probe-interval must be seconds")?)
			}
			"--probe-timeout" => {
				probe_timeout =
					Some(value("--probe-timeout")?.parse().map_err(|_| "--probe-timeout must be seconds")?)
			}
			"--probe-failures" => {
				probe_failures =
					Some(value("--probe-failures")?.parse().map_err(|_| "--probe-failures must be a number")?)
			}
			flag if flag.starts_with("--") => return Err(format!("unknown flag: {}", flag)),
			positional => {
				if script.is_some() {
					return Err(format!("unexpected argument: {}", positional));
				}
				script = Some(PathBuf::from(positional));
			}
		}
	}

	let script = script.ok_or("a script path is required")?;
	let name = match config_name {
		Some(name) => name,
		None => script
			.file_stem()
			.map(|s| s.to_string_lossy().to_string())
			.ok_or("cannot derive a name from the script path; pass --name")?,
	};

	let probe = match (probe_kind, probe_target) {
		(Some(kind), Some(target)) => Some(ProbeConfig {
			kind,
			target,
			interval_secs: probe_interval.unwrap_or(5),
			timeout_secs: probe_timeout.unwrap_or(3),
			failure_threshold: probe_failures.unwrap_or(3),
		}),
		(None, None) => None,
		_ => return Err("--probe-type and --probe-target go together".to_string()),
	};

	// Kill/backoff timeouts stay unset; the daemon fills its configured
	// defaults at registration.
	let mut config = WorkerConfig::new(name, script);
	config.args = script_args;
	config.env = env;
	config.mode = if cluster { Mode::Cluster } else { Mode::Fork };
	config.instances = instances.unwrap_or(if cluster { 0 } else { 1 });
	config.port = port;
	config.dev_mode = dev;
	config.probe = probe;
	config.reload_command = reload_command;
	config.log_sink = log_sink;
	Ok(config)
}
