use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sbx::Session;
use serde_json::{Value, json};

pub async fn write(session: &Session, local: &Path, remote: &str, timeout: Duration) -> Result<Value> {
	let content = tokio::fs::read(local).await.with_context(|| format!("failed to read {}", local.display()))?;
	let size = content.len();
	session.write(remote, content, timeout).await?;
	Ok(json!({ "path": remote, "size": size }))
}

pub async fn read(session: &Session, remote: &str, output: Option<&Path>, timeout: Duration) -> Result<Value> {
	let content = session.read(remote, timeout).await?;
	match output {
		Some(file) => {
			tokio::fs::write(file, &content).await.with_context(|| format!("failed to write {}", file.display()))?;
			Ok(json!({ "path": remote, "size": content.len(), "output": file.display().to_string() }))
		}
		None => Ok(json!({
			"path": remote,
			"size": content.len(),
			"content": String::from_utf8_lossy(&content),
		})),
	}
}

pub async fn list(session: &Session, path: &str, timeout: Duration) -> Result<Value> {
	let entries = session.list(path, timeout).await?;
	Ok(json!({ "path": path, "entries": entries }))
}

pub async fn exists(session: &Session, path: &str, timeout: Duration) -> Result<Value> {
	Ok(json!({ "path": path, "exists": session.exists(path, timeout).await? }))
}
