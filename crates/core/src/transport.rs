//! HTTP requests to the in-sandbox runtime, with routing headers and bounded retries.
//!
//! Retries happen here and nowhere else: only idempotent verbs are retried,
//! only on 500/502/503/504 or connection failures, with exponential backoff
//! from [`RetryPolicy`].

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use sbx_protocol::{HEADER_SANDBOX_ID, HEADER_SANDBOX_NAMESPACE, HEADER_SANDBOX_PORT};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{Result, SandboxError};

/// Everything except unreserved characters is escaped, `/` included.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Encodes a remote file path as a single URL path segment.
pub fn encode_path(path: &str) -> String {
	utf8_percent_encode(path, PATH_SEGMENT).to_string()
}

/// Joins `base_url` and `path` with exactly one slash between them.
pub fn join_url(base_url: &str, path: &str) -> String {
	format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub fn is_idempotent(method: &Method) -> bool {
	[Method::GET, Method::HEAD, Method::PUT, Method::DELETE, Method::OPTIONS].contains(method)
}

pub fn is_retryable_status(status: StatusCode) -> bool {
	matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

/// Identity headers the router resolves a backend from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeaders {
	pub sandbox_id: String,
	pub namespace: String,
	pub port: u16,
}

impl RoutingHeaders {
	fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
		builder
			.header(HEADER_SANDBOX_ID, &self.sandbox_id)
			.header(HEADER_SANDBOX_NAMESPACE, &self.namespace)
			.header(HEADER_SANDBOX_PORT, self.port.to_string())
	}
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
	#[default]
	Empty,
	Json(Value),
	Bytes(Vec<u8>),
	/// A single file part.
	Multipart {
		field: String,
		file_name: String,
		content: Vec<u8>,
	},
}

/// Per-request extras.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
	pub headers: Vec<(String, String)>,
	pub body: RequestBody,
	pub timeout: Option<Duration>,
}

impl RequestOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	pub fn json(mut self, body: Value) -> Self {
		self.body = RequestBody::Json(body);
		self
	}

	pub fn bytes(mut self, body: Vec<u8>) -> Self {
		self.body = RequestBody::Bytes(body);
		self
	}

	pub fn file(mut self, field: impl Into<String>, file_name: impl Into<String>, content: Vec<u8>) -> Self {
		self.body = RequestBody::Multipart {
			field: field.into(),
			file_name: file_name.into(),
			content,
		};
		self
	}

	pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
		self.timeout = timeout;
		self
	}
}

/// Pooled HTTP client plus retry policy.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: reqwest::Client,
	retry: RetryPolicy,
}

impl HttpTransport {
	pub fn new(retry: RetryPolicy) -> Result<Self> {
		let client = reqwest::Client::builder().use_rustls_tls().build()?;
		Ok(Self::with_client(client, retry))
	}

	pub fn with_client(client: reqwest::Client, retry: RetryPolicy) -> Self {
		Self { client, retry }
	}

	pub fn retry(&self) -> &RetryPolicy {
		&self.retry
	}

	fn build(&self, method: &Method, url: &str, routing: &RoutingHeaders, options: &RequestOptions) -> Result<RequestBuilder> {
		let mut builder = routing.apply(self.client.request(method.clone(), url));
		for (name, value) in &options.headers {
			builder = builder.header(name.as_str(), value.as_str());
		}
		if let Some(timeout) = options.timeout {
			builder = builder.timeout(timeout);
		}
		builder = match &options.body {
			RequestBody::Empty => builder,
			RequestBody::Json(value) => builder.json(value),
			RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
			RequestBody::Multipart { field, file_name, content } => {
				let part = Part::bytes(content.clone())
					.file_name(file_name.clone())
					.mime_str("application/octet-stream")?;
				builder.multipart(Form::new().part(field.clone(), part))
			}
		};
		Ok(builder)
	}

	/// Sends `method path` to `base_url` and returns the successful response.
	///
	/// Non-success statuses that are not retried become
	/// [`SandboxError::HttpStatus`]; exhausted retries become
	/// [`SandboxError::TransientNetwork`].
	pub async fn send(&self, base_url: &str, method: Method, path: &str, routing: &RoutingHeaders, options: &RequestOptions) -> Result<Response> {
		let url = join_url(base_url, path);
		let idempotent = is_idempotent(&method);
		let retries = if idempotent { self.retry.max_retries } else { 0 };
		let mut attempt = 0u32;

		loop {
			debug!(target = "sbx.transport", %method, %url, attempt, "sending request");
			let failure = match self.build(&method, &url, routing, options)?.send().await {
				Ok(response) if response.status().is_success() => return Ok(response),
				Ok(response) if idempotent && is_retryable_status(response.status()) => format!("status {}", response.status()),
				Ok(response) => return Err(status_error(&method, &url, response).await),
				Err(err) if idempotent && err.is_connect() => err.to_string(),
				Err(err) => return Err(err.into()),
			};

			if attempt >= retries {
				return Err(SandboxError::TransientNetwork {
					method: method.to_string(),
					url,
					attempts: attempt + 1,
					message: failure,
				});
			}
			let delay = self.retry.delay(attempt);
			warn!(target = "sbx.transport", %method, %url, attempt, delay_ms = delay.as_millis() as u64, reason = %failure, "retrying request");
			tokio::time::sleep(delay).await;
			attempt += 1;
		}
	}
}

async fn status_error(method: &Method, url: &str, response: Response) -> SandboxError {
	let status = response.status().as_u16();
	let body = response.text().await.unwrap_or_default();
	SandboxError::HttpStatus {
		method: method.to_string(),
		url: url.to_string(),
		status,
		body,
	}
}
