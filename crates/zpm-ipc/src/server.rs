//! Newline-delimited JSON request/response server on the local socket.
//! Every command gets exactly one `{ok, ...}` line back, except `logs`,
//! which turns the connection into a chunk stream until the client closes.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

use zpm_core::protocol::{Request, Response};
use zpm_engine::Supervisor;

/// Binds the control socket. A failure here is fatal to the daemon.
pub fn bind(socket_path: &Path) -> std::io::Result<UnixListener> {
	UnixListener::bind(socket_path)
}

/// Accept loop; runs until the daemon is torn down.
pub async fn serve(supervisor: Arc<Supervisor>, listener: UnixListener) {
	loop {
		let (stream, _) = match listener.accept().await {
			Ok(s) => s,
			Err(e) => {
				tracing::error!(error = %e, "accept error");
				continue;
			}
		};
		let supervisor = Arc::clone(&supervisor);
		tokio::spawn(async move {
			handle_connection(supervisor, stream).await;
		});
	}
}

async fn handle_connection(supervisor: Arc<Supervisor>, stream: UnixStream) {
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Ok(Some(line)) = lines.next_line().await {
		let request: Request = match serde_json::from_str(&line) {
			Ok(r) => r,
			Err(e) => {
				tracing::debug!(error = %e, "unparsable request line");
				if write_line(&mut writer, &Response::err("Invalid JSON")).await.is_err() {
					break;
				}
				continue;
			}
		};

		if let Request::Logs { name } = request {
			stream_logs(&supervisor, name.as_deref(), &mut lines, &mut writer).await;
			break;
		}

		let response = handle_request(&supervisor, request).await;
		if write_line(&mut writer, &response).await.is_err() {
			break;
		}
	}
}

pub async fn handle_request(supervisor: &Arc<Supervisor>, request: Request) -> Response {
	match request {
		Request::Ping => Response::ok("pong"),
		Request::Start { name, mut config } => {
			config.name = name;
			reply(supervisor.start(config).await)
		}
		Request::Stop { name } => reply(supervisor.stop(&name).await),
		Request::Restart { name } => reply(supervisor.restart(&name).await),
		Request::Delete { name } => reply(supervisor.delete(&name).await),
		Request::Stats { name } => match supervisor.stats(name.as_deref()).await {
			Ok(stats) => Response::ok(stats),
			Err(e) => Response::err(e.to_string()),
		},
		Request::List => Response::ok(supervisor.list().await),
		Request::GetStore => Response::ok(supervisor.store_records()),
		// Handled before dispatch; a bare fall-through keeps the match total.
		Request::Logs { .. } => Response::err("logs is a streaming command"),
	}
}

fn reply(result: Result<String, zpm_engine::EngineError>) -> Response {
	match result {
		Ok(message) => Response::ok(message),
		Err(e) => {
			if !e.is_usage() {
				tracing::error!(error = %e, "command failed");
			}
			Response::err(e.to_string())
		}
	}
}

/// Forwards output chunks of the selected workers to the client until it
/// disconnects. All broadcast subscriptions are dropped on the way out;
/// nothing keeps feeding a dead connection.
async fn stream_logs(
	supervisor: &Arc<Supervisor>,
	name: Option<&str>,
	lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
	writer: &mut OwnedWriteHalf,
) {
	let targets = match supervisor.logs_targets(name).await {
		Ok(t) => t,
		Err(e) => {
			let _ = write_line(writer, &Response::err(e.to_string())).await;
			return;
		}
	};
	// Chunks only carry a `[name] ` prefix when more than one worker shares
	// the stream.
	let multiplex = targets.len() > 1;

	let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(256);
	let mut pumps = JoinSet::new();
	for (worker, mut receiver) in targets {
		let tx = tx.clone();
		pumps.spawn(async move {
			loop {
				match receiver.recv().await {
					Ok(chunk) => {
						if tx.send((worker.clone(), chunk)).await.is_err() {
							break;
						}
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						tracing::debug!(worker = %worker, skipped, "logs subscriber lagged");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
	}
	drop(tx);

	loop {
		tokio::select! {
			chunk = rx.recv() => {
				let Some((worker, chunk)) = chunk else { break };
				let text = String::from_utf8_lossy(&chunk);
				let payload = if multiplex {
					format!("[{}] {}", worker, text)
				} else {
					text.into_owned()
				};
				if write_line(writer, &Response::ok(payload)).await.is_err() {
					break;
				}
			}
			line = lines.next_line() => {
				match line {
					Ok(Some(_)) => continue,
					// EOF or error: the client is gone.
					_ => break,
				}
			}
		}
	}
	pumps.abort_all();
}

async fn write_line(writer: &mut OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
	let mut data = serde_json::to_vec(response).unwrap_or_else(|_| b"{\"ok\":false,\"error\":\"serialize\"}".to_vec());
	data.push(b'\n');
	writer.write_all(&data).await
}
