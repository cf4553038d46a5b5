//! Well-known names shared by the client, the router, and the cluster.

/// Header carrying the sandbox identity (the claim name).
pub const HEADER_SANDBOX_ID: &str = "X-Sandbox-ID";
/// Header carrying the namespace the sandbox lives in.
pub const HEADER_SANDBOX_NAMESPACE: &str = "X-Sandbox-Namespace";
/// Header carrying the port the in-sandbox runtime listens on.
pub const HEADER_SANDBOX_PORT: &str = "X-Sandbox-Port";

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
pub const GATEWAY_API_VERSION: &str = "v1";
pub const GATEWAY_PLURAL: &str = "gateways";

pub const CLAIM_API_GROUP: &str = "extensions.agents.x-k8s.io";
pub const CLAIM_API_VERSION: &str = "v1alpha1";
pub const CLAIM_PLURAL: &str = "sandboxclaims";
pub const CLAIM_KIND: &str = "SandboxClaim";

pub const SANDBOX_API_GROUP: &str = "agents.x-k8s.io";
pub const SANDBOX_API_VERSION: &str = "v1alpha1";
pub const SANDBOX_PLURAL: &str = "sandboxes";

/// Annotation set by the controller when the pod name differs from the sandbox name.
pub const POD_NAME_ANNOTATION: &str = "agents.x-k8s.io/pod-name";
/// Annotation carrying the serialized trace context of the acquiring client.
pub const TRACE_CONTEXT_ANNOTATION: &str = "opentelemetry.io/trace-context";

/// Condition type reported by a sandbox once its pod is serving.
pub const READY_CONDITION: &str = "Ready";

/// Port the in-sandbox runtime listens on unless configured otherwise.
pub const DEFAULT_SERVER_PORT: u16 = 8888;
/// Port the router service exposes inside the cluster.
pub const DEFAULT_ROUTER_PORT: u16 = 8080;
/// Router service targeted by the local port-forward tunnel.
pub const DEFAULT_ROUTER_SERVICE: &str = "svc/sandbox-router-svc";
pub const DEFAULT_NAMESPACE: &str = "default";
/// DNS suffix for in-cluster service names.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "svc.cluster.local";
