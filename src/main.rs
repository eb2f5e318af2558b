use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use modelgate::config::Config;
use modelgate::proxy::app::{AppState, build_router};
use modelgate::telemetry::FileLogSink;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "modelgate", about = "Reverse proxy for LLM backends")]
struct Args {
	/// Path to the YAML config file.
	#[arg(long, env = "MODELGATE_CONFIG", default_value = "config.yaml")]
	config: PathBuf,

	/// Listen address, overriding proxy_settings.server.
	#[arg(long, env = "MODELGATE_LISTEN")]
	listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let config = Arc::new(Config::load(&args.config)?);
	let addr = args.listen.clone().unwrap_or_else(|| {
		let server = &config.proxy_settings.server;
		format!("{}:{}", server.host, server.port)
	});

	let log_dir = config
		.proxy_settings
		.logging
		.log_dir
		.clone()
		.unwrap_or_else(|| "logs/requests".to_string());
	let log_sink = Arc::new(FileLogSink::new(PathBuf::from(log_dir)));

	let state = AppState::from_config(config, log_sink.clone())?;
	info!(
		backends = state.registry.list().len(),
		"proxy router initialized"
	);
	for name in state.registry.list() {
		info!(model = %name, "backend available");
	}

	let app = build_router(state);
	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("failed to bind {addr}"))?;
	info!(addr = %addr, "modelgate listening");

	axum::serve(listener, app)
		.with_graceful_shutdown(async {
			let _ = tokio::signal::ctrl_c().await;
			info!("shutdown signal received");
		})
		.await?;

	// Let background request-log writes drain before exiting.
	log_sink.wait_idle().await;
	Ok(())
}
