//! Payloads of the HTTP API served by the runtime inside each sandbox.

use serde::{Deserialize, Deserializer, Serialize};

/// Exit code reported when the runtime omits one.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

fn unknown_exit_code() -> i32 {
	UNKNOWN_EXIT_CODE
}

fn exit_code_or_unknown<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(Option::<i32>::deserialize(deserializer)?.unwrap_or(UNKNOWN_EXIT_CODE))
}

fn string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
	D: Deserializer<'de>,
{
	Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `POST /execute` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
	pub command: String,
}

/// `POST /agent` body for computer-use runtimes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
	pub query: String,
}

/// Output of a command run inside the sandbox.
///
/// A nonzero `exit_code` or non-empty `stderr` describes the remote command,
/// not the transport; both are ordinary payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
	#[serde(default, deserialize_with = "string_or_empty")]
	pub stdout: String,
	#[serde(default, deserialize_with = "string_or_empty")]
	pub stderr: String,
	#[serde(default = "unknown_exit_code", deserialize_with = "exit_code_or_unknown")]
	pub exit_code: i32,
}

impl Default for ExecutionResult {
	fn default() -> Self {
		Self {
			stdout: String::new(),
			stderr: String::new(),
			exit_code: UNKNOWN_EXIT_CODE,
		}
	}
}

impl ExecutionResult {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
	File,
	Directory,
}

/// One entry of a `GET /list/{path}` response, in remote directory order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
	pub name: String,
	pub size: u64,
	#[serde(rename = "type")]
	pub file_type: FileType,
	/// Last modification time as POSIX seconds.
	pub mod_time: f64,
}

impl FileEntry {
	pub fn is_dir(&self) -> bool {
		self.file_type == FileType::Directory
	}
}

/// `GET /exists/{path}` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistsResponse {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default)]
	pub exists: bool,
}

/// Body of health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
	pub status: String,
}

impl HealthStatus {
	pub fn ok() -> Self {
		Self { status: "ok".to_string() }
	}
}
