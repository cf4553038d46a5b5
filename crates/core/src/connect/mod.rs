//! Strategies for turning a ready sandbox into a reachable base URL.
//!
//! Exactly one [`Connectivity`] variant is chosen per session, in priority
//! order: explicit URL, gateway discovery, local tunnel.

use std::net::Ipv6Addr;
use std::sync::Arc;

use sbx_runtime::TunnelHandle;
use tracing::info;

use crate::cluster::ClusterApi;
use crate::config::SandboxConfig;
use crate::error::Result;
use crate::watch::GatewayWatcher;

mod tunnel;

pub use tunnel::open_tunnel;

/// How a session reaches its sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connectivity {
	/// Caller-supplied base URL; no discovery.
	ExplicitUrl(String),
	/// Base URL from the address assigned to a gateway.
	Gateway { name: String, namespace: String },
	/// Port-forward to the router service on a local port.
	LocalTunnel,
}

impl Connectivity {
	pub fn select(config: &SandboxConfig) -> Self {
		if let Some(url) = &config.api_url {
			return Connectivity::ExplicitUrl(url.clone());
		}
		if let Some(name) = &config.gateway_name {
			return Connectivity::Gateway {
				name: name.clone(),
				namespace: config.gateway_namespace.clone(),
			};
		}
		Connectivity::LocalTunnel
	}

	pub fn label(&self) -> &'static str {
		match self {
			Connectivity::ExplicitUrl(_) => "explicit-url",
			Connectivity::Gateway { .. } => "gateway",
			Connectivity::LocalTunnel => "tunnel",
		}
	}
}

/// Outcome of [`Connectivity::establish`].
#[derive(Debug)]
pub struct Established {
	pub base_url: String,
	/// Present only for [`Connectivity::LocalTunnel`]; owned by the session.
	pub tunnel: Option<TunnelHandle>,
}

impl Connectivity {
	/// Runs the strategy. On failure nothing is left running.
	pub async fn establish(&self, config: &SandboxConfig, cluster: &Arc<dyn ClusterApi>) -> Result<Established> {
		let established = match self {
			Connectivity::ExplicitUrl(url) => Established {
				base_url: url.trim_end_matches('/').to_string(),
				tunnel: None,
			},
			Connectivity::Gateway { name, namespace } => {
				let watcher = GatewayWatcher::new(Arc::clone(cluster), config.resources.gateway.clone());
				let address = watcher.wait_address(name, namespace, config.gateway_ready_timeout).await?;
				Established {
					base_url: format!("http://{}", host_for_url(&address)),
					tunnel: None,
				}
			}
			Connectivity::LocalTunnel => {
				let tunnel = open_tunnel(config).await?;
				Established {
					base_url: format!("http://127.0.0.1:{}", tunnel.local_port()),
					tunnel: Some(tunnel),
				}
			}
		};
		info!(target = "sbx.connect", strategy = self.label(), base_url = %established.base_url, "connectivity established");
		Ok(established)
	}
}

/// Brackets bare IPv6 literals.
fn host_for_url(address: &str) -> String {
	if address.parse::<Ipv6Addr>().is_ok() { format!("[{address}]") } else { address.to_string() }
}
