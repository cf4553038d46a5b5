//! Deadline-bounded waits on cluster watch streams.
//!
//! A watch that closes or fails transiently is reopened while the deadline
//! allows, so a server-side watch timeout or a dropped connection never ends
//! the wait early.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use sbx_protocol::{ApiStatus, Gateway, Sandbox, WatchEvent, WatchEventType};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cluster::ClusterApi;
use crate::config::ResourceRef;
use crate::error::{Result, SandboxError};

const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Identifiers of a sandbox observed as ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySandboxInfo {
	pub sandbox_name: String,
	pub pod_name: String,
	pub annotations: BTreeMap<String, String>,
}

impl ReadySandboxInfo {
	fn from_sandbox(sandbox: Sandbox) -> Result<Self> {
		let sandbox_name = sandbox
			.metadata
			.name
			.clone()
			.ok_or_else(|| SandboxError::Protocol("ready sandbox has no metadata.name".into()))?;
		let pod_name = sandbox.pod_name().unwrap_or(&sandbox_name).to_string();
		Ok(Self {
			sandbox_name,
			pod_name,
			annotations: sandbox.metadata.annotations,
		})
	}
}

/// Watches `resource/name` until `check` yields a value. Returns `Ok(None)`
/// when `deadline` passes first.
async fn watch_until<T, F>(cluster: &dyn ClusterApi, resource: &ResourceRef, namespace: &str, name: &str, deadline: Instant, mut check: F) -> Result<Option<T>>
where
	F: FnMut(&WatchEvent) -> Result<Option<T>>,
{
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return Ok(None);
		}

		let mut events = match tokio::time::timeout_at(deadline, cluster.watch(resource, namespace, name, remaining)).await {
			Err(_) => return Ok(None),
			Ok(Ok(events)) => events,
			Ok(Err(err)) if err.is_transient() => {
				warn!(target = "sbx.watch", resource = %resource.plural, name, error = %err, "watch failed to open; retrying");
				reconnect_pause(deadline).await;
				continue;
			}
			Ok(Err(err)) => return Err(err),
		};

		loop {
			let event = match tokio::time::timeout_at(deadline, events.next()).await {
				Err(_) => return Ok(None),
				Ok(None) => {
					debug!(target = "sbx.watch", resource = %resource.plural, name, "watch closed; reopening");
					break;
				}
				Ok(Some(Ok(event))) => event,
				Ok(Some(Err(SandboxError::Json(err)))) => {
					warn!(target = "sbx.watch", resource = %resource.plural, name, error = %err, "skipping undecodable watch event");
					continue;
				}
				Ok(Some(Err(err))) if err.is_transient() => {
					warn!(target = "sbx.watch", resource = %resource.plural, name, error = %err, "watch interrupted; reopening");
					break;
				}
				Ok(Some(Err(err))) => return Err(err),
			};

			if event.event_type == WatchEventType::Error {
				let err = status_error(&event);
				if err.is_transient() {
					debug!(target = "sbx.watch", resource = %resource.plural, name, error = %err, "watch expired; reopening");
					break;
				}
				return Err(err);
			}

			if let Some(found) = check(&event)? {
				return Ok(Some(found));
			}
		}

		reconnect_pause(deadline).await;
	}
}

async fn reconnect_pause(deadline: Instant) {
	tokio::time::sleep_until((Instant::now() + RECONNECT_DELAY).min(deadline)).await;
}

fn status_error(event: &WatchEvent) -> SandboxError {
	let status: ApiStatus = serde_json::from_value(event.object.clone()).unwrap_or_default();
	SandboxError::Api {
		operation: "watch".to_string(),
		status: status.code.unwrap_or(500),
		message: status.message.unwrap_or_else(|| "watch error".to_string()),
	}
}

/// Waits for a sandbox to report `Ready=True`.
#[derive(Clone)]
pub struct ReadinessWatcher {
	cluster: Arc<dyn ClusterApi>,
	resource: ResourceRef,
}

impl ReadinessWatcher {
	pub fn new(cluster: Arc<dyn ClusterApi>, resource: ResourceRef) -> Self {
		Self { cluster, resource }
	}

	/// Blocks until the sandbox named `name` is ready, or fails with
	/// [`SandboxError::ReadinessTimeout`] after `timeout`.
	pub async fn wait_ready(&self, name: &str, namespace: &str, timeout: Duration) -> Result<ReadySandboxInfo> {
		let deadline = Instant::now() + timeout;
		let found = watch_until(self.cluster.as_ref(), &self.resource, namespace, name, deadline, |event| {
			if !event.carries_state() {
				return Ok(None);
			}
			let sandbox: Sandbox = match serde_json::from_value(event.object.clone()) {
				Ok(sandbox) => sandbox,
				Err(err) => {
					warn!(target = "sbx.watch", name, error = %err, "ignoring malformed sandbox object");
					return Ok(None);
				}
			};
			if !sandbox.is_ready() {
				return Ok(None);
			}
			ReadySandboxInfo::from_sandbox(sandbox).map(Some)
		})
		.await?;

		match found {
			Some(info) => {
				info!(target = "sbx.watch", sandbox = %info.sandbox_name, pod = %info.pod_name, "sandbox ready");
				Ok(info)
			}
			None => Err(SandboxError::ReadinessTimeout {
				claim: name.to_string(),
				timeout,
			}),
		}
	}
}

/// Waits for a gateway to be assigned an address.
#[derive(Clone)]
pub struct GatewayWatcher {
	cluster: Arc<dyn ClusterApi>,
	resource: ResourceRef,
}

impl GatewayWatcher {
	pub fn new(cluster: Arc<dyn ClusterApi>, resource: ResourceRef) -> Self {
		Self { cluster, resource }
	}

	/// Returns the gateway's first address, or fails with
	/// [`SandboxError::ConnectivityTimeout`] after `timeout`.
	pub async fn wait_address(&self, name: &str, namespace: &str, timeout: Duration) -> Result<String> {
		let deadline = Instant::now() + timeout;
		let found = watch_until(self.cluster.as_ref(), &self.resource, namespace, name, deadline, |event| {
			if !event.carries_state() {
				return Ok(None);
			}
			let gateway: Gateway = serde_json::from_value(event.object.clone()).unwrap_or_default();
			Ok(gateway.first_address().map(str::to_string))
		})
		.await?;

		match found {
			Some(address) => {
				info!(target = "sbx.watch", gateway = name, namespace, %address, "gateway address assigned");
				Ok(address)
			}
			None => Err(SandboxError::ConnectivityTimeout {
				message: format!("gateway '{namespace}/{name}' was not assigned an address within {timeout:?}"),
				stderr: None,
			}),
		}
	}
}
