//! Claim creation and idempotent deletion.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sbx_protocol::{SandboxClaim, TRACE_CONTEXT_ANNOTATION};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterApi, DeleteOutcome};
use crate::config::ResourceRef;
use crate::error::{Result, SandboxError};

const CLAIM_PREFIX: &str = "sandbox-claim-";

/// A claim submitted (or about to be submitted) by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
	pub name: String,
	pub namespace: String,
	pub template: String,
	pub trace_context: Option<String>,
}

impl Claim {
	/// New claim with a random `sandbox-claim-<8 hex>` name.
	pub fn generate(template: impl Into<String>, namespace: impl Into<String>) -> Result<Self> {
		Ok(Self {
			name: generate_claim_name()?,
			namespace: namespace.into(),
			template: template.into(),
			trace_context: None,
		})
	}

	pub fn with_trace_context(mut self, context: Option<String>) -> Self {
		self.trace_context = context;
		self
	}

	/// Manifest for `resource`'s `apiVersion`.
	pub fn manifest(&self, resource: &ResourceRef) -> SandboxClaim {
		let mut annotations = BTreeMap::new();
		if let Some(context) = &self.trace_context {
			annotations.insert(TRACE_CONTEXT_ANNOTATION.to_string(), context.clone());
		}
		let mut manifest = SandboxClaim::new(resource.api_version(), &self.name, &self.template, annotations);
		manifest.metadata.namespace = Some(self.namespace.clone());
		manifest
	}
}

impl fmt::Display for Claim {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.namespace, self.name)
	}
}

fn generate_claim_name() -> Result<String> {
	let mut bytes = [0u8; 4];
	getrandom::fill(&mut bytes).map_err(|err| SandboxError::Protocol(format!("no randomness available for claim name: {err}")))?;
	let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
	Ok(format!("{CLAIM_PREFIX}{suffix}"))
}

/// Creates and deletes claims through a [`ClusterApi`].
#[derive(Clone)]
pub struct ClaimManager {
	cluster: Arc<dyn ClusterApi>,
	resource: ResourceRef,
}

impl ClaimManager {
	pub fn new(cluster: Arc<dyn ClusterApi>, resource: ResourceRef) -> Self {
		Self { cluster, resource }
	}

	/// Generates a claim for `template` and submits it.
	pub async fn create(&self, template: &str, namespace: &str, trace_context: Option<String>) -> Result<Claim> {
		let claim = Claim::generate(template, namespace)?.with_trace_context(trace_context);
		self.submit(&claim).await?;
		Ok(claim)
	}

	/// Submits a prepared claim. Conflicts and other failures are not retried.
	pub async fn submit(&self, claim: &Claim) -> Result<()> {
		let body = serde_json::to_value(claim.manifest(&self.resource))?;
		match self.cluster.create(&self.resource, &claim.namespace, &claim.name, body).await {
			Ok(()) => {
				info!(target = "sbx.claim", claim = %claim.name, namespace = %claim.namespace, template = %claim.template, "claim created");
				Ok(())
			}
			Err(err) => {
				warn!(target = "sbx.claim", claim = %claim.name, error = %err, "claim creation failed");
				Err(err)
			}
		}
	}

	/// Deletes `claim`. Not-found counts as success; other failures are logged
	/// and reported as `false`.
	pub async fn delete(&self, claim: &Claim) -> bool {
		match self.cluster.delete(&self.resource, &claim.namespace, &claim.name).await {
			Ok(DeleteOutcome::Deleted) => {
				info!(target = "sbx.claim", claim = %claim.name, namespace = %claim.namespace, "claim deleted");
				true
			}
			Ok(DeleteOutcome::NotFound) => {
				debug!(target = "sbx.claim", claim = %claim.name, "claim already gone");
				true
			}
			Err(err) => {
				warn!(target = "sbx.claim", claim = %claim.name, error = %err, "failed to delete claim");
				false
			}
		}
	}
}
