//! Error taxonomy for session acquisition, transport, and cluster access.

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors surfaced by sandbox sessions.
///
/// A nonzero exit code or stderr output from a remote command is never an
/// error here; it is returned as ordinary [`sbx_protocol::ExecutionResult`] data.
#[derive(Debug, Error)]
pub enum SandboxError {
	/// A claim with the generated name already exists. Not retried.
	#[error("claim '{name}' already exists in namespace '{namespace}'")]
	ResourceConflict { name: String, namespace: String },

	#[error("sandbox '{claim}' did not become ready within {timeout:?}")]
	ReadinessTimeout { claim: String, timeout: Duration },

	#[error("{message}{}", optional_stderr_suffix(.stderr))]
	ConnectivityTimeout { message: String, stderr: Option<String> },

	/// The port-forward process exited while the session depended on it.
	#[error("tunnel process crashed ({status}){}", stderr_suffix(.stderr))]
	TunnelCrashed { status: String, stderr: String },

	/// Retryable failures persisted past the retry bound.
	#[error("{method} {url} failed after {attempts} attempt(s): {message}")]
	TransientNetwork {
		method: String,
		url: String,
		attempts: u32,
		message: String,
	},

	#[error("sandbox is not ready for communication")]
	NotReady,

	#[error("session has been released")]
	Released,

	#[error("session acquisition was already started")]
	AlreadyAcquired,

	#[error("cluster API {operation} failed with status {status}: {message}")]
	Api { operation: String, status: u16, message: String },

	#[error("{method} {url} returned {status}: {body}")]
	HttpStatus {
		method: String,
		url: String,
		status: u16,
		body: String,
	},

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("failed to spawn '{program}': {source}")]
	Spawn {
		program: String,
		#[source]
		source: io::Error,
	},

	#[error(transparent)]
	Io(#[from] io::Error),

	#[error(transparent)]
	Http(#[from] reqwest::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl SandboxError {
	/// Whether a cluster watch should be re-established after this error.
	pub fn is_transient(&self) -> bool {
		match self {
			SandboxError::Http(err) => err.is_connect() || err.is_timeout() || err.is_body() || err.is_request(),
			SandboxError::Api { status, .. } => *status >= 500 || *status == 410 || *status == 429,
			SandboxError::Io(_) => true,
			_ => false,
		}
	}

	/// Captured subprocess stderr, when the error carries any.
	pub fn stderr(&self) -> Option<&str> {
		match self {
			SandboxError::TunnelCrashed { stderr, .. } => Some(stderr),
			SandboxError::ConnectivityTimeout { stderr, .. } => stderr.as_deref(),
			_ => None,
		}
	}
}

fn stderr_suffix(stderr: &str) -> String {
	let text = stderr.trim();
	if text.is_empty() { String::new() } else { format!("\nstderr: {text}") }
}

fn optional_stderr_suffix(stderr: &Option<String>) -> String {
	stderr.as_deref().map(stderr_suffix).unwrap_or_default()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tunnel_crash_message_includes_stderr() {
		let err = SandboxError::TunnelCrashed {
			status: "exit status: 1".to_string(),
			stderr: "error: unable to forward port\n".to_string(),
		};
		let message = err.to_string();
		assert!(message.contains("exit status: 1"));
		assert!(message.contains("unable to forward port"));
		assert_eq!(err.stderr(), Some("error: unable to forward port\n"));
	}

	#[test]
	fn connectivity_timeout_omits_empty_stderr() {
		let err = SandboxError::ConnectivityTimeout {
			message: "gateway 'g' had no address".to_string(),
			stderr: Some("  ".to_string()),
		};
		assert_eq!(err.to_string(), "gateway 'g' had no address");
	}

	#[test]
	fn server_side_api_errors_are_transient() {
		let gone = SandboxError::Api {
			operation: "watch".to_string(),
			status: 410,
			message: "too old resource version".to_string(),
		};
		assert!(gone.is_transient());

		let forbidden = SandboxError::Api {
			operation: "watch".to_string(),
			status: 403,
			message: "forbidden".to_string(),
		};
		assert!(!forbidden.is_transient());
		assert!(!SandboxError::NotReady.is_transient());
	}
}
