//! Local port lifecycle helpers shared by tunnel and session consumers.

use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::time::Duration;

use tokio::net::TcpStream;

/// Returns `true` when `port` can be bound on localhost.
pub fn port_available(port: u16) -> bool {
	TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Asks the OS for an ephemeral localhost port and releases it immediately.
///
/// The port is free at return time only; another process may claim it before
/// the caller binds it.
pub fn free_local_port() -> io::Result<u16> {
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
	Ok(listener.local_addr()?.port())
}

/// Returns `true` when a TCP connect to `127.0.0.1:port` succeeds within `timeout`.
pub async fn port_accepting(port: u16, timeout: Duration) -> bool {
	matches!(
		tokio::time::timeout(timeout, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await,
		Ok(Ok(_))
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bound_port_is_reported_unavailable() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		assert!(!port_available(port));
		drop(listener);
		assert!(port_available(port));
	}

	#[test]
	fn free_port_is_bindable() {
		let port = free_local_port().unwrap();
		assert_ne!(port, 0);
		assert!(port_available(port));
	}

	#[tokio::test]
	async fn accepting_tracks_listener() {
		let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
		let port = listener.local_addr().unwrap().port();
		assert!(port_accepting(port, Duration::from_millis(200)).await);
		drop(listener);
		assert!(!port_accepting(port, Duration::from_millis(200)).await);
	}
}
