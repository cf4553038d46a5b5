use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;
use sbx_protocol::{DEFAULT_CLUSTER_DOMAIN, DEFAULT_NAMESPACE, DEFAULT_SERVER_PORT};

/// Router settings. Every flag falls back to an `SBX_ROUTER_*` environment variable.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
	/// Address to listen on
	#[arg(long, env = "SBX_ROUTER_LISTEN", default_value = "0.0.0.0:8080")]
	pub listen: SocketAddr,

	/// Namespace used when a request carries no X-Sandbox-Namespace header
	#[arg(long, env = "SBX_ROUTER_DEFAULT_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
	pub default_namespace: String,

	/// Port used when a request carries no X-Sandbox-Port header
	#[arg(long, env = "SBX_ROUTER_DEFAULT_PORT", default_value_t = DEFAULT_SERVER_PORT)]
	pub default_port: u16,

	/// DNS suffix appended to `<id>.<namespace>`
	#[arg(long, env = "SBX_ROUTER_CLUSTER_DOMAIN", default_value = DEFAULT_CLUSTER_DOMAIN)]
	pub cluster_domain: String,

	/// Upper bound for a single proxied exchange, in seconds
	#[arg(long = "upstream-timeout", env = "SBX_ROUTER_UPSTREAM_TIMEOUT", default_value_t = 180)]
	pub upstream_timeout_secs: u64,
}

impl RouterConfig {
	pub fn upstream_timeout(&self) -> Duration {
		Duration::from_secs(self.upstream_timeout_secs)
	}

	pub fn with_cluster_domain(mut self, domain: impl Into<String>) -> Self {
		self.cluster_domain = domain.into();
		self
	}

	pub fn with_defaults(mut self, namespace: impl Into<String>, port: u16) -> Self {
		self.default_namespace = namespace.into();
		self.default_port = port;
		self
	}
}

impl Default for RouterConfig {
	fn default() -> Self {
		Self {
			listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
			default_namespace: DEFAULT_NAMESPACE.to_string(),
			default_port: DEFAULT_SERVER_PORT,
			cluster_domain: DEFAULT_CLUSTER_DOMAIN.to_string(),
			upstream_timeout_secs: 180,
		}
	}
}
