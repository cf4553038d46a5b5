//! Stateless reverse proxy in front of sandbox pods.
//!
//! Every request names its sandbox through the `X-Sandbox-*` headers; the
//! router resolves that to the in-cluster service address and streams the
//! request and response through unchanged. Nothing is cached between
//! requests apart from the upstream connection pool.

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod target;

pub use config::RouterConfig;
pub use error::RouteError;
pub use proxy::{app, app_with_client};
pub use target::{Target, resolve_target};
