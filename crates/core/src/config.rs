//! Session configuration.
//!
//! Every field has a default, so a config file only needs the keys it
//! changes. Durations are written as (fractional) seconds.

use std::path::Path;
use std::time::Duration;

use sbx_protocol::{
	CLAIM_API_GROUP, CLAIM_API_VERSION, CLAIM_PLURAL, DEFAULT_NAMESPACE, DEFAULT_ROUTER_PORT, DEFAULT_ROUTER_SERVICE, DEFAULT_SERVER_PORT,
	GATEWAY_API_GROUP, GATEWAY_API_VERSION, GATEWAY_PLURAL, SANDBOX_API_GROUP, SANDBOX_API_VERSION, SANDBOX_PLURAL,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// Default span name prefix for recorded operations.
pub const DEFAULT_TRACE_SERVICE: &str = "sandbox-client";

mod secs {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_f64(value.as_secs_f64())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let secs = f64::deserialize(deserializer)?;
		Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
	}
}

/// Group, version, and plural of a custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
	pub group: String,
	pub version: String,
	pub plural: String,
}

impl ResourceRef {
	pub fn new(group: impl Into<String>, version: impl Into<String>, plural: impl Into<String>) -> Self {
		Self {
			group: group.into(),
			version: version.into(),
			plural: plural.into(),
		}
	}

	/// `group/version`, as written to `apiVersion`.
	pub fn api_version(&self) -> String {
		format!("{}/{}", self.group, self.version)
	}
}

/// The three resources a session touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRefs {
	pub claim: ResourceRef,
	pub sandbox: ResourceRef,
	pub gateway: ResourceRef,
}

impl Default for ResourceRefs {
	fn default() -> Self {
		Self {
			claim: ResourceRef::new(CLAIM_API_GROUP, CLAIM_API_VERSION, CLAIM_PLURAL),
			sandbox: ResourceRef::new(SANDBOX_API_GROUP, SANDBOX_API_VERSION, SANDBOX_PLURAL),
			gateway: ResourceRef::new(GATEWAY_API_GROUP, GATEWAY_API_VERSION, GATEWAY_PLURAL),
		}
	}
}

/// Retry bounds for idempotent in-sandbox requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
	pub max_retries: u32,
	#[serde(with = "secs")]
	pub backoff_base: Duration,
	#[serde(with = "secs")]
	pub backoff_max: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 5,
			backoff_base: Duration::from_millis(500),
			backoff_max: Duration::from_secs(8),
		}
	}
}

impl RetryPolicy {
	/// No retries at all.
	pub fn none() -> Self {
		Self {
			max_retries: 0,
			..Self::default()
		}
	}

	/// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
	pub fn delay(&self, retry: u32) -> Duration {
		let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
		self.backoff_base.saturating_mul(factor).min(self.backoff_max)
	}
}

/// Port-forward command line. Arguments may contain `{service}`,
/// `{local_port}`, `{remote_port}`, and `{namespace}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelCommand {
	pub program: String,
	pub args: Vec<String>,
}

impl Default for TunnelCommand {
	fn default() -> Self {
		Self {
			program: "kubectl".to_string(),
			args: ["port-forward", "{service}", "{local_port}:{remote_port}", "-n", "{namespace}"]
				.into_iter()
				.map(String::from)
				.collect(),
		}
	}
}

impl TunnelCommand {
	pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		Self {
			program: program.into(),
			args: args.into_iter().map(Into::into).collect(),
		}
	}

	/// Arguments with placeholders substituted.
	pub fn render(&self, service: &str, local_port: u16, remote_port: u16, namespace: &str) -> Vec<String> {
		let local = local_port.to_string();
		let remote = remote_port.to_string();
		self.args
			.iter()
			.map(|arg| {
				arg.replace("{service}", service)
					.replace("{local_port}", &local)
					.replace("{remote_port}", &remote)
					.replace("{namespace}", namespace)
			})
			.collect()
	}
}

/// Everything needed to acquire and talk to one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SandboxConfig {
	/// Template the claim is instantiated from.
	pub template: String,
	pub namespace: String,
	/// Discover the base URL from this gateway's address.
	pub gateway_name: Option<String>,
	pub gateway_namespace: String,
	/// Talk to this base URL directly; skips gateway discovery and tunnels.
	pub api_url: Option<String>,
	/// Port of the in-sandbox runtime, sent as `X-Sandbox-Port`.
	pub server_port: u16,
	#[serde(with = "secs")]
	pub sandbox_ready_timeout: Duration,
	#[serde(with = "secs")]
	pub gateway_ready_timeout: Duration,
	#[serde(with = "secs")]
	pub port_forward_ready_timeout: Duration,
	#[serde(with = "secs")]
	pub port_forward_poll_interval: Duration,
	#[serde(with = "secs")]
	pub tunnel_stop_grace: Duration,
	pub router_service: String,
	pub router_port: u16,
	pub tunnel_command: TunnelCommand,
	/// Fixed local tunnel port; an ephemeral one is picked when unset.
	pub local_port: Option<u16>,
	pub retry: RetryPolicy,
	pub resources: ResourceRefs,
	pub trace_service_name: String,
}

impl Default for SandboxConfig {
	fn default() -> Self {
		Self {
			template: String::new(),
			namespace: DEFAULT_NAMESPACE.to_string(),
			gateway_name: None,
			gateway_namespace: DEFAULT_NAMESPACE.to_string(),
			api_url: None,
			server_port: DEFAULT_SERVER_PORT,
			sandbox_ready_timeout: Duration::from_secs(180),
			gateway_ready_timeout: Duration::from_secs(180),
			port_forward_ready_timeout: Duration::from_secs(30),
			port_forward_poll_interval: Duration::from_millis(500),
			tunnel_stop_grace: Duration::from_secs(2),
			router_service: DEFAULT_ROUTER_SERVICE.to_string(),
			router_port: DEFAULT_ROUTER_PORT,
			tunnel_command: TunnelCommand::default(),
			local_port: None,
			retry: RetryPolicy::default(),
			resources: ResourceRefs::default(),
			trace_service_name: DEFAULT_TRACE_SERVICE.to_string(),
		}
	}
}

impl SandboxConfig {
	pub fn new(template: impl Into<String>) -> Self {
		Self {
			template: template.into(),
			..Self::default()
		}
	}

	/// Reads a JSON config file. Missing keys keep their defaults.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path).map_err(|err| SandboxError::Config(format!("cannot read {}: {err}", path.display())))?;
		let config: Self = serde_json::from_str(&raw).map_err(|err| SandboxError::Config(format!("invalid config {}: {err}", path.display())))?;
		Ok(config)
	}

	pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
		self.namespace = namespace.into();
		self
	}

	pub fn with_gateway(mut self, name: impl Into<String>, namespace: impl Into<String>) -> Self {
		self.gateway_name = Some(name.into());
		self.gateway_namespace = namespace.into();
		self
	}

	pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
		self.api_url = Some(url.into());
		self
	}

	pub fn with_server_port(mut self, port: u16) -> Self {
		self.server_port = port;
		self
	}

	pub fn with_sandbox_ready_timeout(mut self, timeout: Duration) -> Self {
		self.sandbox_ready_timeout = timeout;
		self
	}

	pub fn with_gateway_ready_timeout(mut self, timeout: Duration) -> Self {
		self.gateway_ready_timeout = timeout;
		self
	}

	pub fn with_port_forward_ready_timeout(mut self, timeout: Duration) -> Self {
		self.port_forward_ready_timeout = timeout;
		self
	}

	pub fn with_port_forward_poll_interval(mut self, interval: Duration) -> Self {
		self.port_forward_poll_interval = interval;
		self
	}

	pub fn with_tunnel_stop_grace(mut self, grace: Duration) -> Self {
		self.tunnel_stop_grace = grace;
		self
	}

	pub fn with_router(mut self, service: impl Into<String>, port: u16) -> Self {
		self.router_service = service.into();
		self.router_port = port;
		self
	}

	pub fn with_tunnel_command(mut self, command: TunnelCommand) -> Self {
		self.tunnel_command = command;
		self
	}

	pub fn with_local_port(mut self, port: u16) -> Self {
		self.local_port = Some(port);
		self
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	pub fn with_resources(mut self, resources: ResourceRefs) -> Self {
		self.resources = resources;
		self
	}

	pub fn with_trace_service_name(mut self, name: impl Into<String>) -> Self {
		self.trace_service_name = name.into();
		self
	}

	/// Rejects configurations no session could be acquired with.
	pub fn validate(&self) -> Result<()> {
		if self.template.trim().is_empty() {
			return Err(SandboxError::Config("template must not be empty".into()));
		}
		if self.namespace.trim().is_empty() {
			return Err(SandboxError::Config("namespace must not be empty".into()));
		}
		if self.gateway_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
			return Err(SandboxError::Config("gateway name must not be empty".into()));
		}
		if let Some(url) = &self.api_url {
			url::Url::parse(url).map_err(|err| SandboxError::Config(format!("invalid api url '{url}': {err}")))?;
		}
		if self.tunnel_command.program.trim().is_empty() {
			return Err(SandboxError::Config("tunnel program must not be empty".into()));
		}
		if self.port_forward_poll_interval.is_zero() {
			return Err(SandboxError::Config("port-forward poll interval must be positive".into()));
		}
		Ok(())
	}
}
