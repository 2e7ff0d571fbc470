use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::WorkerConfig;

/// One command line on the control socket. Newline-delimited JSON, tagged
/// by `cmd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Request {
	Ping,
	Start { name: String, config: WorkerConfig },
	Stop { name: String },
	Restart { name: String },
	Delete { name: String },
	Stats { name: Option<String> },
	List,
	/// Switches the connection into streaming mode until the client closes.
	Logs { name: Option<String> },
	GetStore,
}

/// One response line: exactly `{ok:true, data}` or `{ok:false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub ok: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl Response {
	pub fn ok(data: impl Serialize) -> Self {
		Self {
			ok: true,
			data: Some(serde_json::to_value(data).unwrap_or(Value::Null)),
			error: None,
		}
	}

	pub fn err(message: impl Into<String>) -> Self {
		Self {
			ok: false,
			data: None,
			error: Some(message.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_tags_are_kebab_case() {
		let line = serde_json::to_string(&Request::GetStore).unwrap();
		assert_eq!(line, r#"{"cmd":"get-store"}"#);

		let req: Request = serde_json::from_str(r#"{"cmd":"stats","name":"api"}"#).unwrap();
		assert!(matches!(req, Request::Stats { name: Some(n) } if n == "api"));
	}

	#[test]
	fn ok_response_omits_error() {
		let line = serde_json::to_string(&Response::ok("pong")).unwrap();
		assert_eq!(line, r#"{"ok":true,"data":"pong"}"#);
	}

	#[test]
	fn err_response_omits_data() {
		let line = serde_json::to_string(&Response::err("Invalid JSON")).unwrap();
		assert_eq!(line, r#"{"ok":false,"error":"Invalid JSON"}"#);
	}

	#[test]
	fn start_request_round_trips() {
		let req = Request::Start {
			name: "api".into(),
			config: WorkerConfig::new("api", "/srv/api.js"),
		};
		let line = serde_json::to_string(&req).unwrap();
		let back: Request = serde_json::from_str(&line).unwrap();
		match back {
			Request::Start { name, config } => {
				assert_eq!(name, "api");
				assert_eq!(config.script, std::path::PathBuf::from("/srv/api.js"));
			}
			other => panic!("unexpected: {:?}", other),
		}
	}
}
