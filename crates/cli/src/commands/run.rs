use std::time::Duration;

use anyhow::Result;
use sbx::Session;
use serde_json::{Value, json};

/// The remote exit code is part of the payload; only transport failures fail the command.
pub async fn execute(session: &Session, command: &str, timeout: Duration) -> Result<Value> {
	let result = session.run(command, timeout).await?;
	Ok(json!({
		"command": command,
		"stdout": result.stdout,
		"stderr": result.stderr,
		"exitCode": result.exit_code,
	}))
}
