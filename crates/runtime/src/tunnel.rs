//! Owned port-forward subprocess bridging a local port into the cluster.
//!
//! A [`TunnelHandle`] exclusively owns its child process. Liveness is checked
//! explicitly with [`TunnelHandle::try_exit`] and shutdown is explicit through
//! [`TunnelHandle::stop`]; the only background work is draining stderr so the
//! pipe never fills and the output is available when the process dies.

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on retained stderr bytes.
const MAX_STDERR_BYTES: usize = 64 * 1024;
/// How long to wait for the stderr pipe to reach EOF after the process exited.
const STDERR_SETTLE: Duration = Duration::from_millis(250);

/// Exit information for a tunnel process that is no longer running.
#[derive(Debug, Clone)]
pub struct TunnelExit {
	pub status: ExitStatus,
	pub stderr: String,
}

impl fmt::Display for TunnelExit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "tunnel exited ({})", self.status)?;
		if !self.stderr.trim().is_empty() {
			write!(f, ": {}", self.stderr.trim())?;
		}
		Ok(())
	}
}

/// A running port-forward process bound to `local_port`.
pub struct TunnelHandle {
	local_port: u16,
	pid: Option<u32>,
	child: Mutex<Option<Child>>,
	exit: Mutex<Option<ExitStatus>>,
	stderr: Arc<Mutex<Vec<u8>>>,
	drain: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for TunnelHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TunnelHandle")
			.field("local_port", &self.local_port)
			.field("pid", &self.pid)
			.field("exit", &*self.exit.lock())
			.finish()
	}
}

impl TunnelHandle {
	/// Spawns `program args..` serving `local_port`. Must be called within a tokio runtime.
	pub fn spawn<S: AsRef<OsStr>>(program: S, args: &[String], local_port: u16) -> io::Result<Self> {
		let mut cmd = Command::new(program.as_ref());
		cmd.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let mut child = cmd.spawn()?;
		let pid = child.id();
		let stderr = Arc::new(Mutex::new(Vec::new()));
		let drain = child.stderr.take().map(|pipe| tokio::spawn(drain_stderr(pipe, Arc::clone(&stderr))));

		debug!(
			target = "sbx.tunnel",
			program = %program.as_ref().to_string_lossy(),
			?args,
			local_port,
			pid,
			"spawned tunnel process"
		);

		Ok(Self {
			local_port,
			pid,
			child: Mutex::new(Some(child)),
			exit: Mutex::new(None),
			stderr,
			drain: Mutex::new(drain),
		})
	}

	pub fn local_port(&self) -> u16 {
		self.local_port
	}

	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	/// Returns the exit status if the process has exited, without blocking.
	pub fn try_exit(&self) -> Option<ExitStatus> {
		if let Some(status) = *self.exit.lock() {
			return Some(status);
		}

		let mut guard = self.child.lock();
		let child = guard.as_mut()?;
		match child.try_wait() {
			Ok(Some(status)) => {
				*self.exit.lock() = Some(status);
				Some(status)
			}
			Ok(None) => None,
			Err(err) => {
				warn!(target = "sbx.tunnel", error = %err, "failed to poll tunnel process");
				None
			}
		}
	}

	/// Returns `true` while the process is running and has not been stopped.
	pub fn is_alive(&self) -> bool {
		let running = self.child.lock().is_some();
		running && self.try_exit().is_none()
	}

	/// Exit details including captured stderr, or `None` while still running.
	pub async fn exited(&self) -> Option<TunnelExit> {
		let status = self.try_exit()?;
		let drain = self.drain.lock().take();
		if let Some(drain) = drain {
			let _ = tokio::time::timeout(STDERR_SETTLE, drain).await;
		}
		Some(TunnelExit {
			status,
			stderr: self.stderr(),
		})
	}

	/// Stderr captured so far, lossily decoded.
	pub fn stderr(&self) -> String {
		String::from_utf8_lossy(&self.stderr.lock()).into_owned()
	}

	/// Requests a graceful shutdown (SIGTERM on unix, a hard kill elsewhere).
	pub fn terminate(&self) -> io::Result<()> {
		let mut guard = self.child.lock();
		let Some(child) = guard.as_mut() else {
			return Ok(());
		};

		#[cfg(unix)]
		{
			let Some(pid) = child.id() else {
				return Ok(());
			};
			let pid = pid.to_string();
			match std::process::Command::new("kill")
				.args(["-TERM", pid.as_str()])
				.stdout(Stdio::null())
				.stderr(Stdio::null())
				.status()
			{
				Ok(status) if status.success() => Ok(()),
				Ok(status) => Err(io::Error::other(format!("kill -TERM {pid} exited with {status}"))),
				Err(err) => Err(err),
			}
		}

		#[cfg(not(unix))]
		{
			child.start_kill()
		}
	}

	/// Forces the process down without waiting for it.
	pub fn kill(&self) -> io::Result<()> {
		match self.child.lock().as_mut() {
			Some(child) => child.start_kill(),
			None => Ok(()),
		}
	}

	/// Terminates, waits up to `grace`, then kills and reaps the process.
	///
	/// Calling `stop` again after it returned is a no-op.
	pub async fn stop(&self, grace: Duration) -> io::Result<()> {
		if self.try_exit().is_some() {
			self.child.lock().take();
			return Ok(());
		}

		self.terminate()?;
		let Some(mut child) = self.child.lock().take() else {
			return Ok(());
		};

		let status = match tokio::time::timeout(grace, child.wait()).await {
			Ok(status) => status?,
			Err(_) => {
				warn!(
					target = "sbx.tunnel",
					pid = self.pid,
					grace_ms = grace.as_millis() as u64,
					"tunnel ignored terminate; killing"
				);
				child.kill().await?;
				child.wait().await?
			}
		};

		debug!(target = "sbx.tunnel", pid = self.pid, %status, "tunnel stopped");
		*self.exit.lock() = Some(status);
		Ok(())
	}
}

async fn drain_stderr(mut pipe: ChildStderr, sink: Arc<Mutex<Vec<u8>>>) {
	let mut chunk = [0u8; 4096];
	loop {
		match pipe.read(&mut chunk).await {
			Ok(0) | Err(_) => break,
			Ok(n) => {
				let mut buf = sink.lock();
				let room = MAX_STDERR_BYTES.saturating_sub(buf.len());
				buf.extend_from_slice(&chunk[..n.min(room)]);
			}
		}
	}
}
