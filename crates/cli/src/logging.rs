use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

/// Stderr subscriber for the CLI: `-v` info, `-vv` debug, warnings otherwise.
/// An explicit `RUST_LOG` takes precedence.
pub fn init_logging(verbose: u8) {
	let level = match verbose {
		0 => "warn",
		1 => "info",
		_ => "debug",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(std::io::stderr().is_terminal())
		.with_target(false)
		.try_init();
}
