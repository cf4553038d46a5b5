//! Local port-forward tunnel launch and readiness probing.

use std::time::Duration;

use sbx_runtime::{TunnelHandle, free_local_port, port_accepting};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};

/// Connect timeout of a single readiness check.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Spawns the port-forward process and waits until its local port accepts
/// connections. On failure the process is stopped before returning.
pub async fn open_tunnel(config: &SandboxConfig) -> Result<TunnelHandle> {
	let local_port = match config.local_port {
		Some(port) => port,
		None => free_local_port()?,
	};
	let command = &config.tunnel_command;
	let args = command.render(&config.router_service, local_port, config.router_port, &config.namespace);
	let tunnel = TunnelHandle::spawn(&command.program, &args, local_port).map_err(|source| SandboxError::Spawn {
		program: command.program.clone(),
		source,
	})?;

	match wait_accepting(&tunnel, config).await {
		Ok(()) => Ok(tunnel),
		Err(err) => {
			if let Err(stop_err) = tunnel.stop(config.tunnel_stop_grace).await {
				warn!(target = "sbx.tunnel", error = %stop_err, "failed to stop tunnel after setup failure");
			}
			Err(err)
		}
	}
}

async fn wait_accepting(tunnel: &TunnelHandle, config: &SandboxConfig) -> Result<()> {
	let port = tunnel.local_port();
	let timeout = config.port_forward_ready_timeout;
	let deadline = Instant::now() + timeout;
	let mut attempts = 0u32;

	loop {
		attempts += 1;
		if let Some(exit) = tunnel.exited().await {
			warn!(target = "sbx.tunnel", port, status = %exit.status, "tunnel exited before accepting connections");
			return Err(SandboxError::TunnelCrashed {
				status: exit.status.to_string(),
				stderr: exit.stderr,
			});
		}

		if port_accepting(port, CONNECT_ATTEMPT_TIMEOUT).await {
			debug!(target = "sbx.tunnel", port, attempts, "tunnel accepting connections");
			return Ok(());
		}

		let now = Instant::now();
		if now >= deadline {
			let stderr = tunnel.stderr();
			return Err(SandboxError::ConnectivityTimeout {
				message: format!("port-forward on 127.0.0.1:{port} not reachable within {timeout:?}"),
				stderr: (!stderr.trim().is_empty()).then_some(stderr),
			});
		}
		tokio::time::sleep(config.port_forward_poll_interval.min(deadline - now)).await;
	}
}

#[cfg(all(test, unix))]
mod tests {
	use std::net::TcpListener;
	use std::time::Instant as StdInstant;

	use super::*;
	use crate::config::TunnelCommand;

	fn config(program: &str, args: &[&str]) -> SandboxConfig {
		SandboxConfig::new("python")
			.with_tunnel_command(TunnelCommand::new(program, args.iter().copied()))
			.with_port_forward_poll_interval(Duration::from_millis(50))
			.with_tunnel_stop_grace(Duration::from_millis(200))
	}

	#[tokio::test]
	async fn ready_once_port_accepts() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		let config = config("sleep", &["30"]).with_local_port(port);

		let tunnel = open_tunnel(&config).await.unwrap();
		assert_eq!(tunnel.local_port(), port);
		assert!(tunnel.is_alive());
		tunnel.stop(Duration::from_secs(2)).await.unwrap();
	}

	#[tokio::test]
	async fn crash_reports_stderr_before_deadline() {
		let config = config("sh", &["-c", "echo 'error: unable to listen on port' >&2; exit 1"])
			.with_port_forward_ready_timeout(Duration::from_secs(10));

		let started = StdInstant::now();
		let err = open_tunnel(&config).await.unwrap_err();
		assert!(started.elapsed() < Duration::from_secs(5));
		match err {
			SandboxError::TunnelCrashed { stderr, .. } => assert!(stderr.contains("unable to listen")),
			other => panic!("unexpected error: {other}"),
		}
	}

	#[tokio::test]
	async fn silent_tunnel_times_out() {
		let config = config("sleep", &["30"]).with_port_forward_ready_timeout(Duration::from_millis(300));
		let started = StdInstant::now();
		let err = open_tunnel(&config).await.unwrap_err();
		assert!(started.elapsed() >= Duration::from_millis(300));
		assert!(matches!(err, SandboxError::ConnectivityTimeout { .. }));
	}

	#[tokio::test]
	async fn placeholders_reach_the_process() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		let config = config("sh", &["-c", "echo \"$0 $1 $2\" >&2; exit 7", "{service}", "{local_port}:{remote_port}", "{namespace}"])
			.with_namespace("team-a")
			.with_router("svc/router", 9090);

		let tunnel = TunnelHandle::spawn(
			&config.tunnel_command.program,
			&config.tunnel_command.render(&config.router_service, port, config.router_port, &config.namespace),
			port,
		)
		.unwrap();
		let deadline = StdInstant::now() + Duration::from_secs(5);
		let exit = loop {
			if let Some(exit) = tunnel.exited().await {
				break exit;
			}
			assert!(StdInstant::now() < deadline);
			tokio::time::sleep(Duration::from_millis(20)).await;
		};
		assert_eq!(exit.stderr.trim(), format!("svc/router {port}:9090 team-a"));
	}

	#[tokio::test]
	async fn missing_program_is_spawn_error() {
		let config = config("/nonexistent/port-forwarder", &[]);
		assert!(matches!(open_tunnel(&config).await, Err(SandboxError::Spawn { .. })));
	}
}
