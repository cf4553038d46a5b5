//! Router behavior against an in-process upstream, driven through `tower::ServiceExt::oneshot`.

use std::net::SocketAddr;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::IntoResponse;
use sbx_router::{RouterConfig, app, app_with_client};
use serde_json::{Value, json};
use tower::ServiceExt;

const DOMAIN: &str = "sandbox.test";

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
	let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
	(
		StatusCode::CREATED,
		[("x-upstream", "echo")],
		Json(json!({
			"method": method.as_str(),
			"path": uri.path(),
			"query": uri.query(),
			"host": header("host"),
			"custom": header("x-custom"),
			"sandbox": header("x-sandbox-id"),
			"body": String::from_utf8_lossy(&body),
		})),
	)
}

async fn upstream() -> u16 {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move { axum::serve(listener, Router::new().fallback(echo)).await.unwrap() });
	port
}

/// Router whose client sends `<id>.<ns>.sandbox.test` to loopback.
fn router_for(hosts: &[&str]) -> Router {
	let mut builder = reqwest::Client::builder().no_proxy();
	for host in hosts {
		builder = builder.resolve(host, SocketAddr::from(([127, 0, 0, 1], 0)));
	}
	app_with_client(RouterConfig::default().with_cluster_domain(DOMAIN), builder.build().unwrap())
}

async fn json_body(response: axum::response::Response) -> Value {
	let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
	serde_json::from_slice(&bytes).unwrap()
}

fn sandbox_request(method: Method, uri: &str, headers: &[(&str, &str)], body: impl Into<Body>) -> Request<Body> {
	let mut builder = Request::builder().method(method).uri(uri);
	for (name, value) in headers {
		builder = builder.header(*name, *value);
	}
	builder.body(body.into()).unwrap()
}

#[tokio::test]
async fn healthz_is_always_ok() {
	let response = app(RouterConfig::default())
		.unwrap()
		.oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
		.await
		.unwrap();
	assert_eq!(response.status(), StatusCode::OK);
	assert_eq!(json_body(response).await, json!({"status": "ok"}));
}

#[tokio::test]
async fn forwards_method_path_query_headers_and_body() {
	let port = upstream().await;
	let port_header = port.to_string();
	let request = sandbox_request(
		Method::POST,
		"/execute/sub?verbose=1",
		&[
			("X-Sandbox-ID", "s1"),
			("X-Sandbox-Namespace", "ns1"),
			("X-Sandbox-Port", port_header.as_str()),
			("X-Custom", "kept"),
			("Host", "router.example"),
		],
		r#"{"command":"echo hi"}"#,
	);

	let response = router_for(&["s1.ns1.sandbox.test"]).oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::CREATED);
	assert_eq!(response.headers()["x-upstream"], "echo");

	let seen = json_body(response).await;
	assert_eq!(seen["method"], "POST");
	assert_eq!(seen["path"], "/execute/sub");
	assert_eq!(seen["query"], "verbose=1");
	assert_eq!(seen["host"], format!("s1.ns1.sandbox.test:{port}"));
	assert_eq!(seen["custom"], "kept");
	assert_eq!(seen["sandbox"], "s1");
	assert_eq!(seen["body"], r#"{"command":"echo hi"}"#);
}

#[tokio::test]
async fn missing_sandbox_id_is_bad_request() {
	let response = router_for(&[]).oneshot(sandbox_request(Method::GET, "/list/tmp", &[], Body::empty())).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	assert_eq!(json_body(response).await, json!({"detail": "X-Sandbox-ID header is required."}));
}

#[tokio::test]
async fn dotted_namespace_is_bad_request() {
	let request = sandbox_request(Method::GET, "/", &[("X-Sandbox-ID", "s1"), ("X-Sandbox-Namespace", "ns1.evil.com")], Body::empty());
	let response = router_for(&[]).oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	assert_eq!(json_body(response).await["detail"], "Invalid namespace format.");
}

#[tokio::test]
async fn non_numeric_port_is_bad_request() {
	let request = sandbox_request(Method::GET, "/", &[("X-Sandbox-ID", "s1"), ("X-Sandbox-Port", "http")], Body::empty());
	let response = router_for(&[]).oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	assert_eq!(json_body(response).await["detail"], "Invalid port format.");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
	let closed = {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		listener.local_addr().unwrap().port()
	};
	let port_header = closed.to_string();
	let request = sandbox_request(
		Method::GET,
		"/exists/tmp",
		&[("X-Sandbox-ID", "s1"), ("X-Sandbox-Namespace", "ns1"), ("X-Sandbox-Port", port_header.as_str())],
		Body::empty(),
	);

	let response = router_for(&["s1.ns1.sandbox.test"]).oneshot(request).await.unwrap();
	assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
	assert_eq!(json_body(response).await, json!({"detail": "Could not connect to the backend sandbox: s1"}));
}
