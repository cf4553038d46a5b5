//! Scripted in-memory cluster for exercising session logic without an API server.
//!
//! # Example
//!
//! ```ignore
//! let cluster = Arc::new(FakeCluster::new());
//! cluster.script_watch("sandboxes", WatchScript::new([FakeCluster::ready_sandbox("s1", None)]));
//! let client = SandboxClient::new(config, cluster.clone());
//! let session = client.acquire().await?;
//! assert_eq!(cluster.creates().len(), 1);
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use parking_lot::Mutex;
use sbx_protocol::{POD_NAME_ANNOTATION, WatchEvent, WatchEventType};
use serde_json::{Value, json};

use super::{ClusterApi, DeleteOutcome, WatchStream};
use crate::config::ResourceRef;
use crate::error::{Result, SandboxError};

/// Events one watch call will deliver.
pub struct WatchScript {
	events: Vec<Result<WatchEvent>>,
	delay: Option<Duration>,
	close: bool,
	open_error: Option<SandboxError>,
}

impl WatchScript {
	/// Delivers `events`, then keeps the stream open without further events.
	pub fn new(events: impl IntoIterator<Item = WatchEvent>) -> Self {
		Self {
			events: events.into_iter().map(Ok).collect(),
			delay: None,
			close: false,
			open_error: None,
		}
	}

	/// A watch that opens and never delivers anything.
	pub fn silent() -> Self {
		Self::new([])
	}

	/// The watch call itself fails with `err`.
	pub fn fail(err: SandboxError) -> Self {
		Self {
			open_error: Some(err),
			..Self::silent()
		}
	}

	/// Appends a stream-level error after the scripted events.
	pub fn then_error(mut self, err: SandboxError) -> Self {
		self.events.push(Err(err));
		self
	}

	/// Ends the stream after the last event, as a server-side timeout would.
	pub fn then_close(mut self) -> Self {
		self.close = true;
		self
	}

	/// Waits `delay` before the first event.
	pub fn delayed(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	fn into_stream(self) -> Result<WatchStream> {
		if let Some(err) = self.open_error {
			return Err(err);
		}
		let lead = match self.delay {
			Some(delay) => stream::once(tokio::time::sleep(delay)).filter_map(|_| async { None::<Result<WatchEvent>> }).boxed(),
			None => stream::empty().boxed(),
		};
		let tail = if self.close { stream::empty().boxed() } else { stream::pending().boxed() };
		Ok(lead.chain(stream::iter(self.events)).chain(tail).boxed())
	}
}

/// A `create` call the fake accepted.
#[derive(Debug, Clone)]
pub struct CreatedResource {
	pub resource: ResourceRef,
	pub namespace: String,
	pub name: String,
	pub body: Value,
}

/// Arguments of a `watch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRequest {
	pub plural: String,
	pub namespace: String,
	pub name: String,
}

#[derive(Default)]
struct State {
	live: BTreeSet<(String, String, String)>,
	creates: Vec<CreatedResource>,
	deletes: Vec<(String, String, String)>,
	watches: Vec<WatchRequest>,
	scripts: HashMap<String, VecDeque<WatchScript>>,
	create_failures: VecDeque<SandboxError>,
	conflict_on_create: bool,
	delete_failure: Option<u16>,
}

/// In-memory [`ClusterApi`] recording every call.
///
/// Watches consume scripts queued per plural in FIFO order; with no script
/// queued a watch stays open forever.
#[derive(Default)]
pub struct FakeCluster {
	state: Mutex<State>,
}

impl FakeCluster {
	pub fn new() -> Self {
		Self::default()
	}

	/// Queues the script for the next watch on `plural`.
	pub fn script_watch(&self, plural: &str, script: WatchScript) {
		self.state.lock().scripts.entry(plural.to_string()).or_default().push_back(script);
	}

	/// Every create fails with a name conflict.
	pub fn conflict_on_create(&self) {
		self.state.lock().conflict_on_create = true;
	}

	/// The next create fails with `err`.
	pub fn fail_next_create(&self, err: SandboxError) {
		self.state.lock().create_failures.push_back(err);
	}

	/// Deletes fail with the given API status until cleared with `None`.
	pub fn fail_deletes(&self, status: Option<u16>) {
		self.state.lock().delete_failure = status;
	}

	pub fn creates(&self) -> Vec<CreatedResource> {
		self.state.lock().creates.clone()
	}

	/// `(plural, namespace, name)` of every delete call, in order.
	pub fn deletes(&self) -> Vec<(String, String, String)> {
		self.state.lock().deletes.clone()
	}

	pub fn delete_count(&self, name: &str) -> usize {
		self.state.lock().deletes.iter().filter(|(_, _, n)| n == name).count()
	}

	pub fn watches(&self) -> Vec<WatchRequest> {
		self.state.lock().watches.clone()
	}

	/// Whether `name` was created and not yet deleted.
	pub fn is_live(&self, plural: &str, namespace: &str, name: &str) -> bool {
		self.state
			.lock()
			.live
			.contains(&(plural.to_string(), namespace.to_string(), name.to_string()))
	}

	/// `MODIFIED` event for a sandbox reporting `Ready=True`.
	pub fn ready_sandbox(name: &str, pod_name: Option<&str>) -> WatchEvent {
		let mut metadata = json!({ "name": name });
		if let Some(pod) = pod_name {
			metadata["annotations"][POD_NAME_ANNOTATION] = json!(pod);
		}
		WatchEvent::new(
			WatchEventType::Modified,
			json!({
				"metadata": metadata,
				"status": {"conditions": [{"type": "Ready", "status": "True"}]}
			}),
		)
	}

	/// `ADDED` event for a sandbox that is not ready yet.
	pub fn pending_sandbox(name: &str) -> WatchEvent {
		WatchEvent::new(
			WatchEventType::Added,
			json!({
				"metadata": {"name": name},
				"status": {"conditions": [{"type": "Ready", "status": "False", "reason": "PodPending"}]}
			}),
		)
	}

	/// `MODIFIED` event for a gateway with one assigned address.
	pub fn gateway_with_address(name: &str, address: &str) -> WatchEvent {
		WatchEvent::new(
			WatchEventType::Modified,
			json!({
				"metadata": {"name": name},
				"status": {"addresses": [{"type": "IPAddress", "value": address}]}
			}),
		)
	}

	/// `ERROR` event carrying an API `Status` with `code`.
	pub fn error_event(code: u16, message: &str) -> WatchEvent {
		WatchEvent::new(
			WatchEventType::Error,
			json!({"kind": "Status", "code": code, "message": message}),
		)
	}
}

#[async_trait]
impl ClusterApi for FakeCluster {
	async fn create(&self, resource: &ResourceRef, namespace: &str, name: &str, body: Value) -> Result<()> {
		let mut state = self.state.lock();
		if let Some(err) = state.create_failures.pop_front() {
			return Err(err);
		}
		let key = (resource.plural.clone(), namespace.to_string(), name.to_string());
		if state.conflict_on_create || state.live.contains(&key) {
			return Err(SandboxError::ResourceConflict {
				name: name.to_string(),
				namespace: namespace.to_string(),
			});
		}
		state.live.insert(key);
		state.creates.push(CreatedResource {
			resource: resource.clone(),
			namespace: namespace.to_string(),
			name: name.to_string(),
			body,
		});
		Ok(())
	}

	async fn delete(&self, resource: &ResourceRef, namespace: &str, name: &str) -> Result<DeleteOutcome> {
		let mut state = self.state.lock();
		let key = (resource.plural.clone(), namespace.to_string(), name.to_string());
		state.deletes.push(key.clone());
		if let Some(status) = state.delete_failure {
			return Err(SandboxError::Api {
				operation: "delete".to_string(),
				status,
				message: "injected failure".to_string(),
			});
		}
		Ok(if state.live.remove(&key) { DeleteOutcome::Deleted } else { DeleteOutcome::NotFound })
	}

	async fn watch(&self, resource: &ResourceRef, namespace: &str, name: &str, _timeout: Duration) -> Result<WatchStream> {
		let script = {
			let mut state = self.state.lock();
			state.watches.push(WatchRequest {
				plural: resource.plural.clone(),
				namespace: namespace.to_string(),
				name: name.to_string(),
			});
			state.scripts.get_mut(&resource.plural).and_then(VecDeque::pop_front)
		};
		script.unwrap_or_else(WatchScript::silent).into_stream()
	}
}
