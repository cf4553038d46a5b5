use std::sync::LazyLock;

use axum::http::HeaderMap;
use regex_lite::Regex;
use sbx_protocol::{HEADER_SANDBOX_ID, HEADER_SANDBOX_NAMESPACE, HEADER_SANDBOX_PORT};

use crate::config::RouterConfig;
use crate::error::RouteError;

static DNS_LABEL: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("DNS_LABEL should compile"));

/// Upstream sandbox a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
	pub sandbox_id: String,
	pub namespace: String,
	pub port: u16,
}

impl Target {
	/// `<id>.<namespace>.<domain>:<port>`
	pub fn authority(&self, cluster_domain: &str) -> String {
		format!("{}.{}.{}:{}", self.sandbox_id, self.namespace, cluster_domain, self.port)
	}

	/// Upstream URL for `path_and_query`, which keeps its leading slash.
	pub fn url(&self, cluster_domain: &str, path_and_query: &str) -> String {
		let path_and_query = if path_and_query.starts_with('/') { path_and_query.to_string() } else { format!("/{path_and_query}") };
		format!("http://{}{}", self.authority(cluster_domain), path_and_query)
	}
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
	headers.get(name).and_then(|value| value.to_str().ok()).map(str::trim)
}

/// Resolves the identity headers of one request. Pure: no I/O and no shared state.
pub fn resolve_target(headers: &HeaderMap, config: &RouterConfig) -> Result<Target, RouteError> {
	let sandbox_id = match headers.get(HEADER_SANDBOX_ID) {
		None => return Err(RouteError::MissingSandboxId),
		Some(value) => value.to_str().map_err(|_| RouteError::InvalidSandboxId)?.trim(),
	};
	if sandbox_id.is_empty() {
		return Err(RouteError::MissingSandboxId);
	}
	if !DNS_LABEL.is_match(sandbox_id) {
		return Err(RouteError::InvalidSandboxId);
	}

	let namespace = match headers.get(HEADER_SANDBOX_NAMESPACE) {
		None => config.default_namespace.as_str(),
		Some(_) => header(headers, HEADER_SANDBOX_NAMESPACE).ok_or(RouteError::InvalidNamespace)?,
	};
	if !DNS_LABEL.is_match(namespace) {
		return Err(RouteError::InvalidNamespace);
	}

	let port = match headers.get(HEADER_SANDBOX_PORT) {
		None => config.default_port,
		Some(_) => header(headers, HEADER_SANDBOX_PORT)
			.and_then(|raw| raw.parse::<u16>().ok())
			.ok_or(RouteError::InvalidPort)?,
	};

	Ok(Target {
		sandbox_id: sandbox_id.to_string(),
		namespace: namespace.to_string(),
		port,
	})
}
