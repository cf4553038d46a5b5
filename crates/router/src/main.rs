use anyhow::Context;
use clap::Parser;
use sbx_router::{RouterConfig, logging};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sbx-router")]
#[command(about = "Header-driven reverse proxy in front of sandbox pods")]
#[command(version)]
struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,

	#[command(flatten)]
	config: RouterConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let listen = cli.config.listen;
	let app = sbx_router::app(cli.config).context("failed to build upstream client")?;
	let listener = tokio::net::TcpListener::bind(listen).await.with_context(|| format!("failed to bind {listen}"))?;
	info!(target = "sbx.router", %listen, "router listening");

	axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
	info!(target = "sbx.router", "router stopped");
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
}
