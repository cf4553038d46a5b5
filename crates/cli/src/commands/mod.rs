mod files;
mod run;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sbx::{ClusterApi, ClusterEndpoint, KubeClient, SandboxClient, Session};
use serde_json::Value;
use tracing::info;

use crate::cli::{Cli, ClusterArgs, Commands};

/// Validates the config, connects to the cluster, and runs one command inside
/// a fresh session. The session is released whatever the command returns.
pub async fn dispatch(cli: Cli) -> Result<()> {
	let config = cli.sandbox_config().context("invalid session config")?;
	let cluster = connect_cluster(&cli.cluster).await?;
	let client = SandboxClient::new(config, cluster)?;
	let timeout = cli.timeout;
	let command = cli.command;

	let output = client
		.with_session(|session| async move {
			info!(target = "sbx", claim = session.claim_name().unwrap_or_default(), "session ready");
			execute(command, &session, timeout).await
		})
		.await?;

	println!("{}", serde_json::to_string_pretty(&output)?);
	Ok(())
}

async fn connect_cluster(args: &ClusterArgs) -> Result<Arc<dyn ClusterApi>> {
	let client = match &args.kubeconfig {
		Some(path) => {
			let endpoint = ClusterEndpoint::from_kubeconfig(path, args.context.as_deref())
				.await
				.with_context(|| format!("failed to load kubeconfig {}", path.display()))?;
			KubeClient::new(&endpoint)?
		}
		None => KubeClient::infer().await.context("no cluster credentials found")?,
	};
	info!(target = "sbx", server = %client.server(), "using cluster");
	Ok(Arc::new(client))
}

async fn execute(command: Commands, session: &Session, timeout: Duration) -> Result<Value> {
	match command {
		Commands::Run { command } => run::execute(session, &command.join(" "), timeout).await,
		Commands::Write { local, remote } => files::write(session, &local, &remote, timeout).await,
		Commands::Read { remote, output } => files::read(session, &remote, output.as_deref(), timeout).await,
		Commands::Ls { path } => files::list(session, &path, timeout).await,
		Commands::Exists { path } => files::exists(session, &path, timeout).await,
	}
}
