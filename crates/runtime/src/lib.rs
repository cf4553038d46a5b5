//! Local process and port plumbing for sandbox sessions.

pub mod process;
pub mod tunnel;

pub use process::{free_local_port, port_accepting, port_available};
pub use tunnel::{TunnelExit, TunnelHandle};
