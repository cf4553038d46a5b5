use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, header};
use axum::response::Response;
use axum::routing::get;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::error::RouteError;
use crate::target::resolve_target;

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-connection",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailer",
	"transfer-encoding",
	"upgrade",
];

struct ProxyState {
	config: RouterConfig,
	client: reqwest::Client,
}

/// Builds the router with its own upstream client.
pub fn app(config: RouterConfig) -> Result<Router, reqwest::Error> {
	let client = reqwest::Client::builder().timeout(config.upstream_timeout()).build()?;
	Ok(app_with_client(config, client))
}

/// Builds the router around a caller-supplied client, e.g. one with DNS overrides.
pub fn app_with_client(config: RouterConfig, client: reqwest::Client) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.fallback(proxy)
		.with_state(Arc::new(ProxyState { config, client }))
}

async fn healthz() -> Json<Value> {
	Json(json!({ "status": "ok" }))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for name in HOP_BY_HOP {
		headers.remove(*name);
	}
}

async fn proxy(State(state): State<Arc<ProxyState>>, request: Request) -> Result<Response, RouteError> {
	let target = resolve_target(request.headers(), &state.config)?;
	let path_and_query = request.uri().path_and_query().map_or("/", |pq| pq.as_str());
	let url = target.url(&state.config.cluster_domain, path_and_query);
	info!(target = "sbx.router", sandbox = %target.sandbox_id, method = %request.method(), %url, "proxying request");

	let (parts, body) = request.into_parts();
	let mut headers = parts.headers;
	headers.remove(header::HOST);
	strip_hop_by_hop(&mut headers);

	let upstream = state
		.client
		.request(parts.method, &url)
		.headers(headers)
		.body(reqwest::Body::wrap_stream(body.into_data_stream()))
		.send()
		.await
		.map_err(|err| {
			if err.is_connect() {
				warn!(target = "sbx.router", sandbox = %target.sandbox_id, %url, error = %err, "upstream connection failed");
				RouteError::Unreachable {
					sandbox_id: target.sandbox_id.clone(),
				}
			} else {
				RouteError::Internal(err.to_string())
			}
		})?;

	let status = upstream.status();
	let mut response_headers = upstream.headers().clone();
	strip_hop_by_hop(&mut response_headers);
	debug!(target = "sbx.router", sandbox = %target.sandbox_id, status = status.as_u16(), "upstream responded");

	let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
	*response.status_mut() = status;
	*response.headers_mut() = response_headers;
	Ok(response)
}
