//! Cluster resource shapes: claims, sandboxes, gateways, and watch events.
//!
//! Only the fields the client reads or writes are modeled; unknown fields are
//! ignored on decode so newer controllers stay compatible.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::{CLAIM_KIND, POD_NAME_ANNOTATION, READY_CONDITION};

/// Decodes `null` as the type's default, which the API server emits for empty maps and lists.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Default + Deserialize<'de>,
{
	Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Subset of Kubernetes `ObjectMeta`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub namespace: Option<String>,
	#[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
	pub annotations: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resource_version: Option<String>,
}

/// Reference to the template a claim is instantiated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
	pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimSpec {
	pub sandbox_template_ref: TemplateRef,
}

/// Request for a sandbox, reconciled by the controller into a `Sandbox`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaim {
	pub api_version: String,
	pub kind: String,
	pub metadata: ObjectMeta,
	pub spec: SandboxClaimSpec,
}

impl SandboxClaim {
	/// Builds a claim manifest for `template` under `api_version` (`group/version`).
	pub fn new(api_version: impl Into<String>, name: impl Into<String>, template: impl Into<String>, annotations: BTreeMap<String, String>) -> Self {
		Self {
			api_version: api_version.into(),
			kind: CLAIM_KIND.to_string(),
			metadata: ObjectMeta {
				name: Some(name.into()),
				annotations,
				..Default::default()
			},
			spec: SandboxClaimSpec {
				sandbox_template_ref: TemplateRef { name: template.into() },
			},
		}
	}
}

/// A status condition as reported by controllers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
	#[serde(rename = "type", default)]
	pub condition_type: String,
	#[serde(default)]
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,
}

impl Condition {
	pub fn is_true(&self, condition_type: &str) -> bool {
		self.condition_type == condition_type && self.status == "True"
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
	#[serde(default, deserialize_with = "nullable")]
	pub conditions: Vec<Condition>,
}

/// Controller-managed sandbox backing a claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
	#[serde(default)]
	pub metadata: ObjectMeta,
	#[serde(default, deserialize_with = "nullable")]
	pub status: SandboxStatus,
}

impl Sandbox {
	/// Returns `true` once any condition reports `Ready=True`.
	pub fn is_ready(&self) -> bool {
		self.status.conditions.iter().any(|c| c.is_true(READY_CONDITION))
	}

	/// Pod backing this sandbox: the pod-name annotation when set, otherwise the sandbox name.
	pub fn pod_name(&self) -> Option<&str> {
		self.metadata
			.annotations
			.get(POD_NAME_ANNOTATION)
			.map(String::as_str)
			.filter(|name| !name.is_empty())
			.or(self.metadata.name.as_deref())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayAddress {
	#[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
	pub address_type: Option<String>,
	#[serde(default)]
	pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
	#[serde(default, deserialize_with = "nullable")]
	pub addresses: Vec<GatewayAddress>,
}

/// Gateway API `Gateway`, read only for its assigned addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
	#[serde(default)]
	pub metadata: ObjectMeta,
	#[serde(default, deserialize_with = "nullable")]
	pub status: GatewayStatus,
}

impl Gateway {
	/// First assigned address, if the gateway has been programmed.
	pub fn first_address(&self) -> Option<&str> {
		self.status.addresses.first().map(|a| a.value.as_str()).filter(|v| !v.is_empty())
	}
}

/// Kind of change reported on a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
	Added,
	Modified,
	Deleted,
	Bookmark,
	Error,
	#[serde(other)]
	Unknown,
}

/// One line of a `?watch=true` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
	#[serde(rename = "type")]
	pub event_type: WatchEventType,
	#[serde(default)]
	pub object: serde_json::Value,
}

impl WatchEvent {
	pub fn new(event_type: WatchEventType, object: serde_json::Value) -> Self {
		Self { event_type, object }
	}

	/// `ADDED` and `MODIFIED` carry the current object state.
	pub fn carries_state(&self) -> bool {
		matches!(self.event_type, WatchEventType::Added | WatchEventType::Modified)
	}
}

/// Kubernetes `Status` object returned on API errors and `ERROR` watch events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
	#[serde(default)]
	pub code: Option<u16>,
	#[serde(default)]
	pub reason: Option<String>,
	#[serde(default)]
	pub message: Option<String>,
}
