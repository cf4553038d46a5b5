//! Ephemeral sandbox sessions.
//!
//! A [`Session`] claims a sandbox from the cluster, waits until it is ready,
//! makes it reachable (explicit URL, gateway address, or a local port-forward
//! tunnel), and exposes typed command and file operations against the runtime
//! inside it. Releasing a session deletes the claim and stops any tunnel.
//!
//! ```ignore
//! let cluster = Arc::new(KubeClient::infer().await?);
//! let client = SandboxClient::new(SandboxConfig::new("python-runtime"), cluster)?;
//! client
//!     .with_session(|session| async move {
//!         let out = session.run("echo hi", DEFAULT_REQUEST_TIMEOUT).await?;
//!         assert_eq!(out.stdout, "hi\n");
//!         Ok::<_, SandboxError>(())
//!     })
//!     .await?;
//! ```

pub mod claim;
pub mod cluster;
pub mod config;
pub mod connect;
pub mod error;
pub mod recorder;
pub mod session;
pub mod transport;
pub mod watch;

pub use claim::{Claim, ClaimManager};
pub use cluster::{ClusterApi, ClusterEndpoint, DeleteOutcome, FakeCluster, KubeClient, WatchScript};
pub use config::{ResourceRef, ResourceRefs, RetryPolicy, SandboxConfig, TunnelCommand};
pub use connect::Connectivity;
pub use error::{Result, SandboxError};
pub use recorder::{ActiveSpan, AttributeValue, MemoryRecorder, NoopRecorder, Recorder, SpanId, TracingRecorder};
pub use sbx_protocol::{ExecutionResult, FileEntry, FileType};
pub use session::{DEFAULT_REQUEST_TIMEOUT, SandboxClient, Session};
pub use watch::{GatewayWatcher, ReadinessWatcher, ReadySandboxInfo};
