//! Shared fixtures: an in-process fake of the runtime served inside each sandbox.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use sbx::{FakeCluster, RetryPolicy, SandboxConfig, TunnelCommand, WatchScript};
use serde_json::{Value, json};

/// Routing headers observed on one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenHeaders {
	pub id: String,
	pub namespace: String,
	pub port: String,
}

#[derive(Default)]
pub struct RuntimeState {
	pub files: BTreeMap<String, Vec<u8>>,
	pub upload_names: Vec<String>,
	pub headers: Vec<SeenHeaders>,
}

/// Fake runtime listening on `127.0.0.1:port`.
pub struct FakeRuntime {
	pub port: u16,
	pub state: Arc<Mutex<RuntimeState>>,
}

impl FakeRuntime {
	pub async fn start() -> Self {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();
		let state = Arc::new(Mutex::new(RuntimeState::default()));
		let app = Router::new()
			.route("/execute", post(execute))
			.route("/agent", post(agent))
			.route("/upload", post(upload))
			.route("/download/{path}", get(download))
			.route("/list/{path}", get(list))
			.route("/exists/{path}", get(exists))
			.with_state(Arc::clone(&state));
		tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
		Self { port, state }
	}

	pub fn url(&self) -> String {
		format!("http://127.0.0.1:{}", self.port)
	}

	pub fn headers(&self) -> Vec<SeenHeaders> {
		self.state.lock().headers.clone()
	}
}

type Shared = State<Arc<Mutex<RuntimeState>>>;

/// Files are keyed relative to the runtime root, as uploads name them.
fn rooted(path: &str) -> &str {
	path.trim_start_matches('/')
}

fn remember(state: &Mutex<RuntimeState>, headers: &HeaderMap) {
	let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
	state.lock().headers.push(SeenHeaders {
		id: get("x-sandbox-id"),
		namespace: get("x-sandbox-namespace"),
		port: get("x-sandbox-port"),
	});
}

async fn execute(State(state): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
	remember(&state, &headers);
	let command = body["command"].as_str().unwrap_or_default().to_string();
	let output = tokio::process::Command::new("sh").arg("-c").arg(&command).output().await.unwrap();
	Json(json!({
		"stdout": String::from_utf8_lossy(&output.stdout),
		"stderr": String::from_utf8_lossy(&output.stderr),
		"exit_code": output.status.code().unwrap_or(-1),
	}))
}

async fn agent(State(state): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
	remember(&state, &headers);
	Json(json!({"stdout": format!("agent: {}", body["query"].as_str().unwrap_or_default()), "stderr": "", "exit_code": 0}))
}

async fn upload(State(state): Shared, headers: HeaderMap, mut multipart: Multipart) -> StatusCode {
	remember(&state, &headers);
	while let Some(field) = multipart.next_field().await.unwrap() {
		if field.name() != Some("file") {
			continue;
		}
		let name = field.file_name().unwrap_or_default().to_string();
		let data = field.bytes().await.unwrap();
		let mut state = state.lock();
		state.upload_names.push(name.clone());
		state.files.insert(name, data.to_vec());
	}
	StatusCode::OK
}

async fn download(State(state): Shared, headers: HeaderMap, Path(path): Path<String>) -> impl IntoResponse {
	remember(&state, &headers);
	match state.lock().files.get(rooted(&path)) {
		Some(data) => (StatusCode::OK, data.clone()).into_response(),
		None => (StatusCode::NOT_FOUND, format!("{path} not found")).into_response(),
	}
}

async fn list(State(state): Shared, headers: HeaderMap, Path(path): Path<String>) -> Json<Value> {
	remember(&state, &headers);
	let dir = rooted(&path).trim_end_matches('/');
	let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
	let state = state.lock();
	let entries: Vec<Value> = state
		.files
		.iter()
		.filter_map(|(name, data)| {
			let rest = name.strip_prefix(&prefix)?;
			(!rest.contains('/')).then(|| json!({"name": rest, "size": data.len(), "type": "file", "mod_time": 1700000000.25}))
		})
		.collect();
	if entries.is_empty() { Json(Value::Null) } else { Json(Value::Array(entries)) }
}

async fn exists(State(state): Shared, headers: HeaderMap, Path(path): Path<String>) -> Json<Value> {
	remember(&state, &headers);
	let exists = state.lock().files.contains_key(rooted(&path));
	Json(json!({"path": path, "exists": exists}))
}

/// Config with short timeouts and fast retries for tests.
pub fn test_config() -> SandboxConfig {
	SandboxConfig::new("python-runtime")
		.with_sandbox_ready_timeout(Duration::from_secs(5))
		.with_gateway_ready_timeout(Duration::from_secs(5))
		.with_port_forward_ready_timeout(Duration::from_secs(5))
		.with_port_forward_poll_interval(Duration::from_millis(50))
		.with_tunnel_stop_grace(Duration::from_millis(500))
		.with_retry(RetryPolicy {
			max_retries: 2,
			backoff_base: Duration::from_millis(10),
			backoff_max: Duration::from_millis(50),
		})
}

/// A "tunnel" that stays alive without forwarding anything; the test owns the port.
pub fn idle_tunnel() -> TunnelCommand {
	TunnelCommand::new("sleep", ["30"])
}

/// Makes every sandbox watch on `cluster` report ready immediately.
///
/// Claim names are random, so the ready object carries a fixed name; the
/// readiness watcher only checks the condition and the object name.
pub fn ready_on_next_watch(cluster: &FakeCluster) {
	cluster.script_watch("sandboxes", WatchScript::new([FakeCluster::ready_sandbox("sandbox-under-test", None)]));
}
