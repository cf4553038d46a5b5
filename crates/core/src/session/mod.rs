//! Session lifecycle: claim, readiness, connectivity, release.
//!
//! A [`Session`] moves through three phases:
//! 1. **Acquire** - create the claim, wait for the sandbox to report ready,
//!    establish connectivity through the selected [`Connectivity`] strategy.
//! 2. **Use** - typed operations (see `ops`), valid only while ready.
//! 3. **Release** - stop the tunnel, delete the claim, end the lifecycle span.
//!
//! Any failure during acquisition runs the release sequence before the error
//! is returned, so a failed acquire never leaves a claim or a process behind.
//! State set during acquisition lives in `OnceLock`s and never changes after,
//! which lets operations run concurrently through a shared reference.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use sbx_runtime::TunnelHandle;
use tracing::{debug, info, warn};

use crate::claim::{Claim, ClaimManager};
use crate::cluster::ClusterApi;
use crate::config::SandboxConfig;
use crate::connect::Connectivity;
use crate::error::{Result, SandboxError};
use crate::recorder::{ActiveSpan, NoopRecorder, Recorder, SpanId};
use crate::transport::HttpTransport;
use crate::watch::{ReadinessWatcher, ReadySandboxInfo};

mod ops;

pub use ops::DEFAULT_REQUEST_TIMEOUT;

/// Factory for sessions sharing one config, cluster client, recorder, and HTTP pool.
#[derive(Clone)]
pub struct SandboxClient {
	config: Arc<SandboxConfig>,
	cluster: Arc<dyn ClusterApi>,
	recorder: Arc<dyn Recorder>,
	transport: HttpTransport,
}

impl SandboxClient {
	/// Validates `config` and builds the shared HTTP client.
	pub fn new(config: SandboxConfig, cluster: Arc<dyn ClusterApi>) -> Result<Self> {
		config.validate()?;
		let transport = HttpTransport::new(config.retry.clone())?;
		Ok(Self {
			config: Arc::new(config),
			cluster,
			recorder: Arc::new(NoopRecorder),
			transport,
		})
	}

	pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
		self.recorder = recorder;
		self
	}

	/// Replaces the pooled HTTP client used for in-sandbox requests.
	pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
		self.transport = HttpTransport::with_client(client, self.config.retry.clone());
		self
	}

	pub fn config(&self) -> &SandboxConfig {
		&self.config
	}

	/// A session that has not started acquisition yet.
	pub fn session(&self) -> Session {
		Session {
			connectivity: Connectivity::select(&self.config),
			claims: ClaimManager::new(Arc::clone(&self.cluster), self.config.resources.claim.clone()),
			config: Arc::clone(&self.config),
			cluster: Arc::clone(&self.cluster),
			recorder: Arc::clone(&self.recorder),
			transport: self.transport.clone(),
			claim: OnceLock::new(),
			sandbox: OnceLock::new(),
			base_url: OnceLock::new(),
			tunnel: OnceLock::new(),
			lifecycle: Mutex::new(None),
			acquire_started: AtomicBool::new(false),
			owns_claim: AtomicBool::new(false),
			released: AtomicBool::new(false),
		}
	}

	/// Creates a session and acquires it.
	pub async fn acquire(&self) -> Result<Session> {
		let session = self.session();
		session.acquire().await?;
		Ok(session)
	}

	/// Acquires a session, runs `f`, and releases the session whatever `f` returns.
	pub async fn with_session<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, E>
	where
		F: FnOnce(Arc<Session>) -> Fut,
		Fut: Future<Output = std::result::Result<T, E>>,
		E: From<SandboxError>,
	{
		let session = Arc::new(self.acquire().await?);
		let outcome = f(Arc::clone(&session)).await;
		session.release().await;
		outcome
	}
}

/// One claimed sandbox and the means to reach it.
pub struct Session {
	config: Arc<SandboxConfig>,
	cluster: Arc<dyn ClusterApi>,
	recorder: Arc<dyn Recorder>,
	transport: HttpTransport,
	claims: ClaimManager,
	connectivity: Connectivity,
	claim: OnceLock<Claim>,
	sandbox: OnceLock<ReadySandboxInfo>,
	base_url: OnceLock<String>,
	tunnel: OnceLock<TunnelHandle>,
	lifecycle: Mutex<Option<SpanId>>,
	acquire_started: AtomicBool,
	owns_claim: AtomicBool,
	released: AtomicBool,
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("claim", &self.claim_name())
			.field("connectivity", &self.connectivity)
			.field("base_url", &self.base_url())
			.field("released", &self.is_released())
			.finish()
	}
}

impl Session {
	/// Exactly when [`Session::base_url`] is `Some`.
	pub fn is_ready(&self) -> bool {
		self.base_url().is_some()
	}

	pub fn is_released(&self) -> bool {
		self.released.load(Ordering::SeqCst)
	}

	pub fn claim_name(&self) -> Option<&str> {
		self.claim.get().map(|c| c.name.as_str())
	}

	pub fn namespace(&self) -> &str {
		&self.config.namespace
	}

	/// Readiness details, once the sandbox has been observed ready.
	pub fn sandbox(&self) -> Option<&ReadySandboxInfo> {
		self.sandbox.get()
	}

	pub fn pod_name(&self) -> Option<&str> {
		self.sandbox.get().map(|s| s.pod_name.as_str())
	}

	/// Set once acquisition connects; `None` again after release.
	pub fn base_url(&self) -> Option<&str> {
		if self.is_released() {
			return None;
		}
		self.base_url.get().map(String::as_str)
	}

	pub fn connectivity(&self) -> &Connectivity {
		&self.connectivity
	}

	/// Local port of the owned tunnel, if this session uses one.
	pub fn tunnel_port(&self) -> Option<u16> {
		self.tunnel.get().map(TunnelHandle::local_port)
	}

	pub fn tunnel_pid(&self) -> Option<u32> {
		self.tunnel.get().and_then(TunnelHandle::pid)
	}

	fn span_name(&self, op: &str) -> String {
		format!("{}.{op}", self.config.trace_service_name)
	}

	fn lifecycle_span(&self) -> Option<SpanId> {
		*self.lifecycle.lock()
	}

	/// Runs acquisition. May be called once; any failure releases the session first.
	pub async fn acquire(&self) -> Result<()> {
		if self.acquire_started.swap(true, Ordering::SeqCst) {
			return Err(SandboxError::AlreadyAcquired);
		}
		if self.is_released() {
			return Err(SandboxError::Released);
		}

		match self.acquire_steps().await {
			Ok(()) => {
				info!(
					target = "sbx.session",
					claim = self.claim_name().unwrap_or_default(),
					base_url = self.base_url().unwrap_or_default(),
					strategy = self.connectivity.label(),
					"session ready"
				);
				Ok(())
			}
			Err(err) => {
				warn!(target = "sbx.session", error = %err, "acquisition failed; releasing");
				self.release().await;
				Err(err)
			}
		}
	}

	async fn acquire_steps(&self) -> Result<()> {
		let recorder = self.recorder.as_ref();
		let lifecycle = recorder.start(&self.span_name("lifecycle"), None);
		*self.lifecycle.lock() = Some(lifecycle);

		let claim = {
			let span = ActiveSpan::start(recorder, &self.span_name("create_claim"), Some(lifecycle));
			let claim = Claim::generate(&self.config.template, &self.config.namespace)?.with_trace_context(recorder.propagation_context(lifecycle));
			span.set("sandbox.claim.name", claim.name.as_str());
			let claim = self.claim.get_or_init(|| claim);
			self.owns_claim.store(true, Ordering::SeqCst);
			if let Err(err) = self.claims.submit(claim).await {
				if matches!(err, SandboxError::ResourceConflict { .. }) {
					self.owns_claim.store(false, Ordering::SeqCst);
				}
				span.set("error", err.to_string());
				return Err(err);
			}
			claim
		};

		{
			let span = ActiveSpan::start(recorder, &self.span_name("wait_for_sandbox_ready"), Some(lifecycle));
			span.set("sandbox.claim.name", claim.name.as_str());
			let watcher = ReadinessWatcher::new(Arc::clone(&self.cluster), self.config.resources.sandbox.clone());
			let info = watcher
				.wait_ready(&claim.name, &claim.namespace, self.config.sandbox_ready_timeout)
				.await
				.inspect_err(|err| span.set("error", err.to_string()))?;
			let _ = self.sandbox.set(info);
		}

		{
			let span = ActiveSpan::start(recorder, &self.span_name("connect"), Some(lifecycle));
			if let Connectivity::Gateway { name, namespace } = &self.connectivity {
				span.set("sandbox.gateway.name", name.as_str());
				span.set("sandbox.gateway.namespace", namespace.as_str());
			}
			let established = self
				.connectivity
				.establish(&self.config, &self.cluster)
				.await
				.inspect_err(|err| span.set("error", err.to_string()))?;
			if let Some(tunnel) = established.tunnel {
				let _ = self.tunnel.set(tunnel);
			}
			let _ = self.base_url.set(established.base_url);
		}
		Ok(())
	}

	/// Stops the tunnel, deletes the claim, ends the lifecycle span, and flushes the recorder.
	///
	/// Each step is best-effort; failures are logged. Calling it again is a no-op.
	pub async fn release(&self) {
		if self.released.swap(true, Ordering::SeqCst) {
			return;
		}

		if let Some(tunnel) = self.tunnel.get() {
			match tunnel.stop(self.config.tunnel_stop_grace).await {
				Ok(()) => debug!(target = "sbx.session", port = tunnel.local_port(), "tunnel stopped"),
				Err(err) => warn!(target = "sbx.session", error = %err, "failed to stop tunnel"),
			}
		}

		if self.owns_claim.swap(false, Ordering::SeqCst) {
			if let Some(claim) = self.claim.get() {
				self.claims.delete(claim).await;
			}
		}

		let lifecycle = self.lifecycle.lock().take();
		if let Some(span) = lifecycle {
			self.recorder.end(span);
		}
		self.recorder.shutdown();
		info!(target = "sbx.session", claim = self.claim_name().unwrap_or_default(), "session released");
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		if self.released.load(Ordering::SeqCst) || !self.acquire_started.load(Ordering::SeqCst) {
			return;
		}
		warn!(target = "sbx.session", claim = self.claim_name().unwrap_or_default(), "session dropped without release");

		if let Some(tunnel) = self.tunnel.get() {
			if let Err(err) = tunnel.kill() {
				warn!(target = "sbx.session", error = %err, "failed to kill tunnel");
			}
		}

		if self.owns_claim.load(Ordering::SeqCst) {
			if let Some(claim) = self.claim.get().cloned() {
				match tokio::runtime::Handle::try_current() {
					Ok(handle) => {
						let claims = self.claims.clone();
						handle.spawn(async move {
							claims.delete(&claim).await;
						});
					}
					Err(_) => warn!(target = "sbx.session", claim = %claim.name, "no async runtime; claim left for garbage collection"),
				}
			}
		}

		if let Some(span) = self.lifecycle.get_mut().take() {
			self.recorder.end(span);
		}
		self.recorder.shutdown();
	}
}
