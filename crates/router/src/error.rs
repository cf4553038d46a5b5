use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Reasons a request could not be proxied.
///
/// Rendered as `{"detail": "<message>"}` with the matching status code.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
	#[error("X-Sandbox-ID header is required.")]
	MissingSandboxId,

	#[error("Invalid sandbox ID format.")]
	InvalidSandboxId,

	#[error("Invalid namespace format.")]
	InvalidNamespace,

	#[error("Invalid port format.")]
	InvalidPort,

	#[error("Could not connect to the backend sandbox: {sandbox_id}")]
	Unreachable { sandbox_id: String },

	#[error("An internal error occurred in the proxy.")]
	Internal(String),
}

impl RouteError {
	pub fn status(&self) -> StatusCode {
		match self {
			Self::MissingSandboxId | Self::InvalidSandboxId | Self::InvalidNamespace | Self::InvalidPort => StatusCode::BAD_REQUEST,
			Self::Unreachable { .. } => StatusCode::BAD_GATEWAY,
			Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

impl IntoResponse for RouteError {
	fn into_response(self) -> Response {
		if let Self::Internal(cause) = &self {
			tracing::error!(target = "sbx.router", error = %cause, "proxying failed");
		}
		(self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
	}
}
