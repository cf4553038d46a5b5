use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use sbx::{SandboxConfig, TunnelCommand};

#[derive(Parser, Debug)]
#[command(name = "sbx")]
#[command(about = "Run commands and move files in ephemeral sandboxes")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// JSON session config; flags given on the command line win over it
	#[arg(long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	#[command(flatten)]
	pub session: SessionArgs,

	#[command(flatten)]
	pub cluster: ClusterArgs,

	/// Per-request timeout in seconds
	#[arg(long, global = true, value_name = "SECS", default_value = "60", value_parser = parse_secs)]
	pub timeout: Duration,

	#[command(subcommand)]
	pub command: Commands,
}

/// Flags mirroring `SandboxConfig`. Unset flags leave the file (or default) value alone.
#[derive(Args, Debug, Default, Clone)]
pub struct SessionArgs {
	/// Sandbox template to claim
	#[arg(short, long, global = true)]
	pub template: Option<String>,

	/// Namespace the claim is created in
	#[arg(short, long, global = true)]
	pub namespace: Option<String>,

	/// Reach the sandbox through this gateway's address
	#[arg(long, global = true, value_name = "NAME")]
	pub gateway: Option<String>,

	/// Namespace of the gateway
	#[arg(long, global = true, value_name = "NAMESPACE", requires = "gateway")]
	pub gateway_namespace: Option<String>,

	/// Talk to this base URL directly (no gateway, no tunnel)
	#[arg(long, global = true, value_name = "URL")]
	pub api_url: Option<String>,

	/// Port the in-sandbox runtime listens on
	#[arg(long, global = true)]
	pub server_port: Option<u16>,

	/// Seconds to wait for the sandbox to become ready
	#[arg(long, global = true, value_name = "SECS", value_parser = parse_secs)]
	pub ready_timeout: Option<Duration>,

	/// Seconds to wait for the gateway address
	#[arg(long, global = true, value_name = "SECS", value_parser = parse_secs)]
	pub gateway_timeout: Option<Duration>,

	/// Seconds to wait for the port-forward tunnel
	#[arg(long, global = true, value_name = "SECS", value_parser = parse_secs)]
	pub tunnel_timeout: Option<Duration>,

	/// Fixed local port for the tunnel instead of a free one
	#[arg(long, global = true)]
	pub local_port: Option<u16>,

	/// Tunnel program; its arguments stay as configured
	#[arg(long, global = true, value_name = "PROGRAM")]
	pub tunnel_program: Option<String>,

	/// Service name used as the span prefix
	#[arg(long, global = true, value_name = "NAME")]
	pub trace_service: Option<String>,
}

/// How to reach the cluster API server.
#[derive(Args, Debug, Default, Clone)]
pub struct ClusterArgs {
	/// Kubeconfig file (defaults to $KUBECONFIG, then ~/.kube/config)
	#[arg(long, global = true, value_name = "FILE")]
	pub kubeconfig: Option<PathBuf>,

	/// Kubeconfig context (defaults to current-context)
	#[arg(long, global = true, value_name = "NAME", requires = "kubeconfig")]
	pub context: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run a shell command in a fresh sandbox
	Run {
		/// Command line, joined with spaces
		#[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
		command: Vec<String>,
	},

	/// Upload a local file
	Write {
		/// Local file to upload
		local: PathBuf,
		/// Destination path inside the sandbox
		remote: String,
	},

	/// Download a file
	Read {
		/// Path inside the sandbox
		remote: String,
		/// Write the content here instead of embedding it in the output
		#[arg(short, long, value_name = "FILE")]
		output: Option<PathBuf>,
	},

	/// List a directory
	#[command(alias = "list")]
	Ls { path: String },

	/// Check whether a path exists
	Exists { path: String },
}

fn parse_secs(raw: &str) -> Result<Duration, String> {
	let secs: f64 = raw.parse().map_err(|_| format!("'{raw}' is not a number of seconds"))?;
	Duration::try_from_secs_f64(secs).map_err(|err| format!("'{raw}': {err}"))
}

impl SessionArgs {
	/// Layers the flags that were given over `base`.
	pub fn apply(&self, mut config: SandboxConfig) -> SandboxConfig {
		if let Some(template) = &self.template {
			config.template = template.clone();
		}
		if let Some(namespace) = &self.namespace {
			config = config.with_namespace(namespace.clone());
		}
		if let Some(gateway) = &self.gateway {
			let namespace = self.gateway_namespace.clone().unwrap_or_else(|| config.gateway_namespace.clone());
			config = config.with_gateway(gateway.clone(), namespace);
		}
		if let Some(url) = &self.api_url {
			config = config.with_api_url(url.clone());
		}
		if let Some(port) = self.server_port {
			config = config.with_server_port(port);
		}
		if let Some(timeout) = self.ready_timeout {
			config = config.with_sandbox_ready_timeout(timeout);
		}
		if let Some(timeout) = self.gateway_timeout {
			config = config.with_gateway_ready_timeout(timeout);
		}
		if let Some(timeout) = self.tunnel_timeout {
			config = config.with_port_forward_ready_timeout(timeout);
		}
		if let Some(port) = self.local_port {
			config = config.with_local_port(port);
		}
		if let Some(program) = &self.tunnel_program {
			let args = config.tunnel_command.args.clone();
			config = config.with_tunnel_command(TunnelCommand::new(program.clone(), args));
		}
		if let Some(service) = &self.trace_service {
			config = config.with_trace_service_name(service.clone());
		}
		config
	}
}

impl Cli {
	/// Config file (if any) with command-line flags on top, validated.
	pub fn sandbox_config(&self) -> sbx::Result<SandboxConfig> {
		let base = match &self.config {
			Some(path) => SandboxConfig::load(path)?,
			None => SandboxConfig::default(),
		};
		let config = self.session.apply(base);
		config.validate()?;
		Ok(config)
	}
}
