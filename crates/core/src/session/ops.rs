//! Typed operations against the in-sandbox runtime API.

use std::time::Duration;

use reqwest::{Method, Response};
use sbx_protocol::{AgentRequest, ExecuteRequest, ExecutionResult, ExistsResponse, FileEntry};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::Session;
use crate::error::{Result, SandboxError};
use crate::recorder::ActiveSpan;
use crate::transport::{RequestOptions, RoutingHeaders, encode_path};

/// Timeout applied by callers that have no better value.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Multipart field the runtime reads uploads from.
const UPLOAD_FIELD: &str = "file";

/// Runtimes join the upload filename onto their root, where an absolute name would escape it.
fn upload_name(path: &str) -> &str {
	path.trim_start_matches('/')
}

impl Session {
	/// Sends a request to the sandbox with routing headers injected.
	///
	/// Fails with [`SandboxError::NotReady`] before acquisition completes,
	/// [`SandboxError::Released`] after release, and
	/// [`SandboxError::TunnelCrashed`] when the owned tunnel has exited.
	pub async fn request(&self, method: Method, path: &str, options: RequestOptions) -> Result<Response> {
		let base_url = self.base_url.get().ok_or(SandboxError::NotReady)?;
		if self.is_released() {
			return Err(SandboxError::Released);
		}
		let claim = self.claim.get().ok_or(SandboxError::NotReady)?;
		self.check_tunnel().await?;

		let routing = RoutingHeaders {
			sandbox_id: claim.name.clone(),
			namespace: claim.namespace.clone(),
			port: self.config.server_port,
		};
		match self.transport.send(base_url, method, path, &routing, &options).await {
			Ok(response) => Ok(response),
			Err(err) => {
				// A dead tunnel explains the failure better than the connect error.
				self.check_tunnel().await?;
				Err(err)
			}
		}
	}

	async fn check_tunnel(&self) -> Result<()> {
		let Some(tunnel) = self.tunnel.get() else {
			return Ok(());
		};
		match tunnel.exited().await {
			Some(exit) => Err(SandboxError::TunnelCrashed {
				status: exit.status.to_string(),
				stderr: exit.stderr,
			}),
			None => Ok(()),
		}
	}

	fn op_span(&self, op: &str) -> ActiveSpan<'_> {
		let span = ActiveSpan::start(self.recorder.as_ref(), &self.span_name(op), self.lifecycle_span());
		if let Some(name) = self.claim_name() {
			span.set("sandbox.claim.name", name);
		}
		span
	}

	/// Runs `command` in the sandbox shell.
	///
	/// The timeout bounds the wait for a response; it does not stop the remote command.
	pub async fn run(&self, command: &str, timeout: Duration) -> Result<ExecutionResult> {
		let span = self.op_span("run");
		span.set("sandbox.command", command);
		let result = async {
			let body = serde_json::to_value(ExecuteRequest { command: command.to_string() })?;
			let response = self.request(Method::POST, "execute", RequestOptions::new().json(body).timeout(Some(timeout))).await?;
			decode_json::<ExecutionResult>(response).await
		}
		.await;
		record(&span, &result);
		let result = result?;
		span.set("sandbox.exit_code", result.exit_code);
		debug!(target = "sbx.session", command, exit_code = result.exit_code, "command finished");
		Ok(result)
	}

	/// Uploads `content` to `path`, overwriting any existing file.
	///
	/// The multipart filename is `path` relative to the runtime root, so the
	/// upload lands where [`Session::read`] looks for it.
	pub async fn write(&self, path: &str, content: impl Into<Vec<u8>>, timeout: Duration) -> Result<()> {
		let content = content.into();
		let span = self.op_span("write");
		span.set("sandbox.file.path", path);
		span.set("sandbox.file.size", content.len());
		let result = self
			.request(
				Method::POST,
				"upload",
				RequestOptions::new().file(UPLOAD_FIELD, upload_name(path), content).timeout(Some(timeout)),
			)
			.await
			.map(drop);
		record(&span, &result);
		result
	}

	/// Downloads the file at `path`.
	pub async fn read(&self, path: &str, timeout: Duration) -> Result<Vec<u8>> {
		let span = self.op_span("read");
		span.set("sandbox.file.path", path);
		let result = async {
			let response = self
				.request(Method::GET, &format!("download/{}", encode_path(path)), RequestOptions::new().timeout(Some(timeout)))
				.await?;
			Ok::<_, SandboxError>(response.bytes().await?.to_vec())
		}
		.await;
		record(&span, &result);
		let content = result?;
		span.set("sandbox.file.size", content.len());
		Ok(content)
	}

	/// Lists the directory at `path` in remote order.
	pub async fn list(&self, path: &str, timeout: Duration) -> Result<Vec<FileEntry>> {
		let span = self.op_span("list");
		span.set("sandbox.file.path", path);
		let result = async {
			let response = self
				.request(Method::GET, &format!("list/{}", encode_path(path)), RequestOptions::new().timeout(Some(timeout)))
				.await?;
			let body = response.bytes().await?;
			if body.iter().all(u8::is_ascii_whitespace) {
				return Ok::<_, SandboxError>(Vec::new());
			}
			let entries: Option<Vec<FileEntry>> = serde_json::from_slice(&body)?;
			Ok(entries.unwrap_or_default())
		}
		.await;
		record(&span, &result);
		let entries = result?;
		span.set("sandbox.file.count", entries.len());
		Ok(entries)
	}

	/// Whether `path` exists in the sandbox.
	pub async fn exists(&self, path: &str, timeout: Duration) -> Result<bool> {
		let span = self.op_span("exists");
		span.set("sandbox.file.path", path);
		let result = async {
			let response = self
				.request(Method::GET, &format!("exists/{}", encode_path(path)), RequestOptions::new().timeout(Some(timeout)))
				.await?;
			Ok::<_, SandboxError>(decode_json::<ExistsResponse>(response).await?.exists)
		}
		.await;
		record(&span, &result);
		let exists = result?;
		span.set("sandbox.file.exists", exists);
		Ok(exists)
	}

	/// Sends a natural-language `query` to a computer-use runtime.
	pub async fn agent(&self, query: &str, timeout: Duration) -> Result<ExecutionResult> {
		let span = self.op_span("agent");
		let result = async {
			let body = serde_json::to_value(AgentRequest { query: query.to_string() })?;
			let response = self.request(Method::POST, "agent", RequestOptions::new().json(body).timeout(Some(timeout))).await?;
			decode_json::<ExecutionResult>(response).await
		}
		.await;
		record(&span, &result);
		let result = result?;
		span.set("sandbox.exit_code", result.exit_code);
		Ok(result)
	}
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
	let body = response.bytes().await?;
	Ok(serde_json::from_slice(&body)?)
}

fn record<T>(span: &ActiveSpan<'_>, result: &Result<T>) {
	if let Err(err) = result {
		span.set("error", err.to_string());
	}
}
