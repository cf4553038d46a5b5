mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{FakeRuntime, idle_tunnel, ready_on_next_watch, test_config};
use sbx::{
	Connectivity, DEFAULT_REQUEST_TIMEOUT, FakeCluster, MemoryRecorder, SandboxClient, SandboxError, TunnelCommand, WatchScript,
};

fn client(config: sbx::SandboxConfig, cluster: &Arc<FakeCluster>) -> SandboxClient {
	SandboxClient::new(config, cluster.clone()).unwrap()
}

#[tokio::test]
async fn ready_only_after_acquisition() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let client = client(test_config().with_api_url(runtime.url()), &cluster);

	let session = client.session();
	assert!(!session.is_ready());
	assert!(matches!(session.run("true", DEFAULT_REQUEST_TIMEOUT).await, Err(SandboxError::NotReady)));

	session.acquire().await.unwrap();
	assert!(session.is_ready());
	assert_eq!(session.base_url(), Some(runtime.url().as_str()));

	session.release().await;
	assert!(!session.is_ready());
	assert_eq!(session.base_url(), None);
}

#[tokio::test]
async fn explicit_url_skips_gateway_and_tunnel() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let config = test_config().with_api_url(runtime.url()).with_tunnel_command(TunnelCommand::new("/nonexistent/forwarder", Vec::<String>::new()));
	let session = client(config, &cluster).acquire().await.unwrap();

	assert_eq!(session.connectivity(), &Connectivity::ExplicitUrl(runtime.url()));
	assert!(session.tunnel_port().is_none());
	let watches = cluster.watches();
	assert_eq!(watches.len(), 1);
	assert_eq!(watches[0].plural, "sandboxes");
	session.release().await;
}

#[tokio::test]
async fn default_strategy_spawns_one_local_tunnel() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let config = test_config().with_tunnel_command(idle_tunnel()).with_local_port(runtime.port);
	let session = client(config, &cluster).acquire().await.unwrap();

	assert_eq!(session.connectivity(), &Connectivity::LocalTunnel);
	assert_eq!(session.tunnel_port(), Some(runtime.port));
	assert!(session.tunnel_pid().is_some());
	assert_eq!(session.base_url(), Some(format!("http://127.0.0.1:{}", runtime.port).as_str()));

	let out = session.run("echo hi", DEFAULT_REQUEST_TIMEOUT).await.unwrap();
	assert_eq!(out.stdout, "hi\n");

	#[cfg(target_os = "linux")]
	let pid = session.tunnel_pid().unwrap();
	session.release().await;
	#[cfg(target_os = "linux")]
	assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists(), "tunnel process outlived release");
}

#[tokio::test]
async fn gateway_strategy_uses_discovered_address() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	cluster.script_watch(
		"gateways",
		WatchScript::new([FakeCluster::gateway_with_address("external-gw", &format!("127.0.0.1:{}", runtime.port))]),
	);
	let config = test_config().with_gateway("external-gw", "infra");
	let session = client(config, &cluster).acquire().await.unwrap();

	assert_eq!(session.base_url(), Some(runtime.url().as_str()));
	assert!(session.tunnel_port().is_none());
	let gateway_watch = cluster.watches().into_iter().find(|w| w.plural == "gateways").unwrap();
	assert_eq!((gateway_watch.name.as_str(), gateway_watch.namespace.as_str()), ("external-gw", "infra"));

	assert!(session.run("true", DEFAULT_REQUEST_TIMEOUT).await.unwrap().success());
	session.release().await;
}

#[tokio::test]
async fn readiness_timeout_cleans_up_once() {
	let cluster = Arc::new(FakeCluster::new());
	let config = test_config().with_api_url("http://127.0.0.1:9").with_sandbox_ready_timeout(Duration::from_millis(300));
	let client = client(config, &cluster);

	let started = Instant::now();
	let err = client.acquire().await.unwrap_err();
	let elapsed = started.elapsed();

	assert!(matches!(err, SandboxError::ReadinessTimeout { .. }), "unexpected error: {err}");
	assert!(elapsed >= Duration::from_millis(300));
	assert!(elapsed < Duration::from_secs(3));
	let claim = cluster.creates()[0].name.clone();
	assert_eq!(cluster.delete_count(&claim), 1);
	assert!(!cluster.is_live("sandboxclaims", "default", &claim));
}

#[cfg(unix)]
#[tokio::test]
async fn crashed_tunnel_fails_fast_with_stderr() {
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let config = test_config()
		.with_port_forward_ready_timeout(Duration::from_secs(10))
		.with_tunnel_command(TunnelCommand::new("sh", ["-c", "echo 'error: pod not running' >&2; exit 1"]));

	let started = Instant::now();
	let err = client(config, &cluster).acquire().await.unwrap_err();
	assert!(started.elapsed() < Duration::from_secs(5));
	assert!(matches!(err, SandboxError::TunnelCrashed { .. }), "unexpected error: {err}");
	assert!(err.stderr().unwrap().contains("pod not running"));
	assert_eq!(cluster.deletes().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn tunnel_death_after_acquire_surfaces_on_next_request() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let config = test_config()
		.with_local_port(runtime.port)
		.with_tunnel_command(TunnelCommand::new("sh", ["-c", "sleep 0.3; echo 'lost connection to pod' >&2; exit 2"]));
	let session = client(config, &cluster).acquire().await.unwrap();

	tokio::time::sleep(Duration::from_millis(800)).await;
	let err = session.run("true", DEFAULT_REQUEST_TIMEOUT).await.unwrap_err();
	match err {
		SandboxError::TunnelCrashed { stderr, .. } => assert!(stderr.contains("lost connection")),
		other => panic!("unexpected error: {other}"),
	}
	session.release().await;
}

#[tokio::test]
async fn release_twice_deletes_once() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let session = client(test_config().with_api_url(runtime.url()), &cluster).acquire().await.unwrap();
	let claim = session.claim_name().unwrap().to_string();

	session.release().await;
	session.release().await;
	assert_eq!(cluster.delete_count(&claim), 1);
	assert!(matches!(session.exists("/x", DEFAULT_REQUEST_TIMEOUT).await, Err(SandboxError::Released)));
}

#[tokio::test]
async fn conflict_does_not_delete_foreign_claim() {
	let cluster = Arc::new(FakeCluster::new());
	cluster.conflict_on_create();
	let err = client(test_config(), &cluster).acquire().await.unwrap_err();
	assert!(matches!(err, SandboxError::ResourceConflict { .. }));
	assert!(cluster.deletes().is_empty());
	assert!(cluster.watches().is_empty());
}

#[tokio::test]
async fn acquire_runs_once() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let session = client(test_config().with_api_url(runtime.url()), &cluster).session();
	session.acquire().await.unwrap();
	assert!(matches!(session.acquire().await, Err(SandboxError::AlreadyAcquired)));
	assert_eq!(cluster.creates().len(), 1);
	session.release().await;
}

#[tokio::test]
async fn with_session_releases_after_error() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let client = client(test_config().with_api_url(runtime.url()), &cluster);

	let outcome: Result<(), SandboxError> = client
		.with_session(|session| async move {
			session.run("true", DEFAULT_REQUEST_TIMEOUT).await?;
			Err(SandboxError::Protocol("caller gave up".into()))
		})
		.await;
	assert!(matches!(outcome, Err(SandboxError::Protocol(_))));
	let claim = cluster.creates()[0].name.clone();
	assert_eq!(cluster.delete_count(&claim), 1);
}

#[tokio::test]
async fn dropped_session_deletes_claim_in_background() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let session = client(test_config().with_api_url(runtime.url()), &cluster).acquire().await.unwrap();
	let claim = session.claim_name().unwrap().to_string();

	drop(session);
	let deadline = Instant::now() + Duration::from_secs(2);
	while cluster.delete_count(&claim) == 0 {
		assert!(Instant::now() < deadline, "claim was never deleted");
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

#[tokio::test]
async fn lifecycle_spans_and_trace_annotation() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let recorder = Arc::new(MemoryRecorder::new().with_propagation(r#"{"traceparent":"00-abc-def-01"}"#));
	let client = client(test_config().with_api_url(runtime.url()).with_trace_service_name("agent-tests"), &cluster).with_recorder(recorder.clone());

	let session = client.acquire().await.unwrap();
	session.run("exit 3", DEFAULT_REQUEST_TIMEOUT).await.unwrap();
	session.release().await;

	let body = &cluster.creates()[0].body;
	assert_eq!(body["metadata"]["annotations"]["opentelemetry.io/trace-context"], r#"{"traceparent":"00-abc-def-01"}"#);

	assert_eq!(recorder.shutdowns(), 1);
	let lifecycle = recorder.span("agent-tests.lifecycle").unwrap();
	assert!(lifecycle.ended);
	let run = recorder.span("agent-tests.run").unwrap();
	assert_eq!(run.parent, Some(lifecycle.id));
	assert_eq!(run.attribute("sandbox.exit_code"), Some(&sbx::AttributeValue::Int(3)));
	assert!(recorder.span("agent-tests.create_claim").is_some());
	assert!(recorder.span("agent-tests.wait_for_sandbox_ready").unwrap().ended);
}

#[tokio::test]
async fn with_session_accepts_anyhow_callers() -> anyhow::Result<()> {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let client = client(test_config().with_api_url(runtime.url()), &cluster);

	let stdout = client
		.with_session(|session| async move {
			let out = session.run("printf scoped", DEFAULT_REQUEST_TIMEOUT).await?;
			anyhow::ensure!(out.success(), "remote command failed: {}", out.stderr);
			Ok(out.stdout)
		})
		.await?;
	assert_eq!(stdout, "scoped");
	assert_eq!(cluster.deletes().len(), 1);
	Ok(())
}

#[tokio::test]
async fn recorder_is_flushed_once_per_teardown() {
	let runtime = FakeRuntime::start().await;
	let cluster = Arc::new(FakeCluster::new());
	ready_on_next_watch(&cluster);
	let recorder = Arc::new(MemoryRecorder::new());
	let client = client(test_config().with_api_url(runtime.url()), &cluster).with_recorder(recorder.clone());

	let session = client.acquire().await.unwrap();
	assert_eq!(recorder.shutdowns(), 0);
	session.release().await;
	session.release().await;
	assert_eq!(recorder.shutdowns(), 1);

	ready_on_next_watch(&cluster);
	drop(client.acquire().await.unwrap());
	assert_eq!(recorder.shutdowns(), 2);

	let failing = Arc::new(MemoryRecorder::new());
	let config = test_config().with_api_url(runtime.url()).with_sandbox_ready_timeout(Duration::from_millis(200));
	let err = self::client(config, &cluster).with_recorder(failing.clone()).acquire().await.unwrap_err();
	assert!(matches!(err, SandboxError::ReadinessTimeout { .. }), "unexpected error: {err}");
	assert_eq!(failing.shutdowns(), 1);
}
