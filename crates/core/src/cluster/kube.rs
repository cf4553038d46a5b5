//! [`ClusterApi`] over the Kubernetes REST API.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use sbx_protocol::{ApiStatus, WatchEvent};
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use super::kubeconfig::ClusterEndpoint;
use super::{ClusterApi, DeleteOutcome, WatchStream};
use crate::config::ResourceRef;
use crate::error::{Result, SandboxError};

/// Bound on create and delete round trips. Watches run under their own deadline.
pub const DEFAULT_API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Custom-resource client for one API server.
#[derive(Clone)]
pub struct KubeClient {
	http: reqwest::Client,
	server: Url,
	token: Option<String>,
	request_timeout: Duration,
}

impl std::fmt::Debug for KubeClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KubeClient").field("server", &self.server.as_str()).finish_non_exhaustive()
	}
}

impl KubeClient {
	pub fn new(endpoint: &ClusterEndpoint) -> Result<Self> {
		Ok(Self {
			http: endpoint.http_client()?,
			server: endpoint.server()?.clone(),
			token: endpoint.token.clone(),
			request_timeout: DEFAULT_API_REQUEST_TIMEOUT,
		})
	}

	/// Overrides [`DEFAULT_API_REQUEST_TIMEOUT`] for create and delete.
	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.request_timeout = timeout;
		self
	}

	/// Client for the inferred endpoint (in-cluster, then kubeconfig).
	pub async fn infer() -> Result<Self> {
		Self::new(&ClusterEndpoint::infer().await?)
	}

	pub fn server(&self) -> &Url {
		&self.server
	}

	fn url(&self, resource: &ResourceRef, namespace: &str, name: Option<&str>) -> Result<Url> {
		let mut url = self.server.clone();
		{
			let mut segments = url
				.path_segments_mut()
				.map_err(|_| SandboxError::Config(format!("API server url '{}' cannot carry a path", self.server)))?;
			segments
				.pop_if_empty()
				.extend(["apis", resource.group.as_str(), resource.version.as_str(), "namespaces", namespace, resource.plural.as_str()]);
			if let Some(name) = name {
				segments.push(name);
			}
		}
		Ok(url)
	}

	fn request(&self, method: Method, url: Url) -> RequestBuilder {
		let builder = self.http.request(method, url);
		match &self.token {
			Some(token) => builder.bearer_auth(token),
			None => builder,
		}
	}
}

/// Maps an unsuccessful response to [`SandboxError::Api`], using the
/// `Status` message when the server sent one.
async fn api_error(operation: &str, response: Response) -> SandboxError {
	let status = response.status();
	let body = response.text().await.unwrap_or_default();
	let message = serde_json::from_str::<ApiStatus>(&body)
		.ok()
		.and_then(|s| s.message)
		.unwrap_or_else(|| body.trim().to_string());
	SandboxError::Api {
		operation: operation.to_string(),
		status: status.as_u16(),
		message,
	}
}

#[async_trait]
impl ClusterApi for KubeClient {
	async fn create(&self, resource: &ResourceRef, namespace: &str, name: &str, body: Value) -> Result<()> {
		let url = self.url(resource, namespace, None)?;
		debug!(target = "sbx.claim", %url, name, "creating resource");
		let response = self
			.request(Method::POST, url)
			.timeout(self.request_timeout)
			.json(&body)
			.send()
			.await?;
		match response.status() {
			status if status.is_success() => Ok(()),
			StatusCode::CONFLICT => Err(SandboxError::ResourceConflict {
				name: name.to_string(),
				namespace: namespace.to_string(),
			}),
			_ => Err(api_error("create", response).await),
		}
	}

	async fn delete(&self, resource: &ResourceRef, namespace: &str, name: &str) -> Result<DeleteOutcome> {
		let url = self.url(resource, namespace, Some(name))?;
		debug!(target = "sbx.claim", %url, "deleting resource");
		let response = self.request(Method::DELETE, url).timeout(self.request_timeout).send().await?;
		match response.status() {
			status if status.is_success() => Ok(DeleteOutcome::Deleted),
			StatusCode::NOT_FOUND => Ok(DeleteOutcome::NotFound),
			_ => Err(api_error("delete", response).await),
		}
	}

	async fn watch(&self, resource: &ResourceRef, namespace: &str, name: &str, timeout: Duration) -> Result<WatchStream> {
		let mut url = self.url(resource, namespace, None)?;
		let timeout_secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
		url.query_pairs_mut()
			.append_pair("watch", "true")
			.append_pair("fieldSelector", &format!("metadata.name={name}"))
			.append_pair("timeoutSeconds", &timeout_secs.to_string());
		debug!(target = "sbx.watch", %url, "opening watch");

		let response = self.request(Method::GET, url).send().await?;
		if !response.status().is_success() {
			return Err(api_error("watch", response).await);
		}

		let state = (Box::pin(response.bytes_stream()), WatchDecoder::default(), VecDeque::new(), false);
		let events = futures_util::stream::unfold(state, |(mut body, mut decoder, mut pending, mut done)| async move {
			loop {
				if let Some(item) = pending.pop_front() {
					return Some((item, (body, decoder, pending, done)));
				}
				if done {
					return None;
				}
				match body.next().await {
					Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
					Some(Err(err)) => {
						pending.push_back(Err(SandboxError::from(err)));
						done = true;
					}
					None => {
						pending.extend(decoder.finish());
						done = true;
					}
				}
			}
		});
		Ok(events.boxed())
	}
}

/// Splits a chunked watch body into newline-delimited JSON events.
#[derive(Debug, Default)]
pub struct WatchDecoder {
	buf: Vec<u8>,
}

impl WatchDecoder {
	/// Feeds a chunk and returns every event completed by it.
	pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<WatchEvent>> {
		self.buf.extend_from_slice(chunk);
		let mut events = Vec::new();
		while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
			let line: Vec<u8> = self.buf.drain(..=pos).collect();
			if let Some(event) = decode_line(&line) {
				events.push(event);
			}
		}
		events
	}

	/// Decodes a trailing event not terminated by a newline.
	pub fn finish(&mut self) -> Option<Result<WatchEvent>> {
		let rest = std::mem::take(&mut self.buf);
		decode_line(&rest)
	}
}

fn decode_line(line: &[u8]) -> Option<Result<WatchEvent>> {
	let line = line.trim_ascii();
	if line.is_empty() {
		return None;
	}
	trace!(target = "sbx.watch", bytes = line.len(), "watch line");
	Some(serde_json::from_slice(line).map_err(SandboxError::from))
}
