use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use zpm_core::types::LogSink;

/// Fan-out point for one worker's child output. Every stdout/stderr chunk
/// is broadcast to live subscribers (the control server's `logs` streams),
/// optionally echoed to the daemon's stdout, and optionally forwarded to a
/// configured sink.
#[derive(Clone)]
pub struct OutputHub {
	name: Arc<str>,
	echo: bool,
	tx: broadcast::Sender<Vec<u8>>,
	sink: Option<Arc<Mutex<SinkState>>>,
}

impl OutputHub {
	pub fn new(name: &str, echo: bool, sink: Option<&LogSink>) -> Self {
		let (tx, _) = broadcast::channel(256);
		Self {
			name: Arc::from(name),
			echo,
			tx,
			sink: sink.map(|s| Arc::new(Mutex::new(SinkState::new(s.clone())))),
		}
	}

	pub fn publish(&self, chunk: &[u8]) {
		if self.echo {
			let text = String::from_utf8_lossy(chunk);
			for line in text.lines() {
				println!("[{}] {}", self.name, line);
			}
		}
		if let Some(sink) = &self.sink {
			sink.lock().expect("sink lock poisoned").write(&self.name, chunk);
		}
		let _ = self.tx.send(chunk.to_vec());
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.tx.subscribe()
	}
}

struct SinkState {
	target: LogSink,
	conn: SinkConn,
	failed: bool,
}

enum SinkConn {
	Idle,
	File(std::fs::File),
	Tcp(std::net::TcpStream),
}

impl SinkState {
	fn new(target: LogSink) -> Self {
		Self {
			target,
			conn: SinkConn::Idle,
			failed: false,
		}
	}

	fn write(&mut self, worker: &str, chunk: &[u8]) {
		if self.failed {
			return;
		}
		if matches!(self.conn, SinkConn::Idle) {
			self.conn = match self.open() {
				Ok(conn) => conn,
				Err(e) => {
					tracing::warn!(worker, error = %e, "log sink unavailable, disabling");
					self.failed = true;
					return;
				}
			};
		}
		let result = match &mut self.conn {
			SinkConn::File(f) => f.write_all(chunk),
			SinkConn::Tcp(s) => s.write_all(chunk),
			SinkConn::Idle => return,
		};
		if let Err(e) = result {
			tracing::warn!(worker, error = %e, "log sink write failed, disabling");
			self.failed = true;
		}
	}

	fn open(&self) -> std::io::Result<SinkConn> {
		match &self.target {
			LogSink::File { target } => {
				if let Some(parent) = target.parent() {
					let _ = std::fs::create_dir_all(parent);
				}
				let file = std::fs::OpenOptions::new().create(true).append(true).open(target)?;
				Ok(SinkConn::File(file))
			}
			LogSink::Tcp { target } => {
				let stream = std::net::TcpStream::connect(target)?;
				stream.set_write_timeout(Some(std::time::Duration::from_secs(2)))?;
				Ok(SinkConn::Tcp(stream))
			}
		}
	}
}
