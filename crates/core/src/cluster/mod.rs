//! Seam between session logic and the cluster control plane.
//!
//! [`KubeClient`] talks to a real API server; [`FakeCluster`] is the scripted
//! double used in tests.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sbx_protocol::WatchEvent;
use serde_json::Value;

use crate::config::ResourceRef;
use crate::error::Result;

pub mod fake;
pub mod kube;
pub mod kubeconfig;

pub use fake::{FakeCluster, WatchScript};
pub use kube::{DEFAULT_API_REQUEST_TIMEOUT, KubeClient};
pub use kubeconfig::ClusterEndpoint;

/// Stream of watch events; ends when the server closes the watch.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
	Deleted,
	NotFound,
}

/// Namespaced custom-resource operations a session needs.
#[async_trait]
pub trait ClusterApi: Send + Sync {
	/// Creates `body` as `resource/name` in `namespace`.
	///
	/// A name collision must surface as [`crate::SandboxError::ResourceConflict`].
	async fn create(&self, resource: &ResourceRef, namespace: &str, name: &str, body: Value) -> Result<()>;

	async fn delete(&self, resource: &ResourceRef, namespace: &str, name: &str) -> Result<DeleteOutcome>;

	/// Opens a watch restricted to the single object `name`.
	///
	/// `timeout` is a server-side hint; callers enforce their own deadline.
	async fn watch(&self, resource: &ResourceRef, namespace: &str, name: &str, timeout: Duration) -> Result<WatchStream>;
}
