//! Wire types for sandbox provisioning and the in-sandbox HTTP API.
//!
//! This crate contains the serde-serializable types exchanged with the
//! cluster API server (claims, sandboxes, gateways, watch events), with the
//! runtime running inside a sandbox (execute/list/exists payloads), and the
//! routing headers understood by the router.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization and small accessors
//! * Lenient on input: Every optional field defaults so partial objects decode
//! * Stable: Changes only when the wire format changes
//!
//! Session orchestration is built on top of these types in `sbx-rs`.

pub mod constants;
pub mod resources;
pub mod runtime_api;

pub use constants::*;
pub use resources::*;
pub use runtime_api::*;
