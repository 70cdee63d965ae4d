use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

mod config;
mod dial;
mod web;

use config::Config;
use dial::WsDialer;
use umbrella_sfu::{FallbackResolver, Sfu, SfuOptions, WebRtcSessionFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::parse();
	config.log.init();

	let factory = WebRtcSessionFactory::new(config.min_port, config.max_port, config.public_ip)
		.context("failed to initialize media transport")?;

	// No multicast resolver is wired by default; DNS is the fallback either
	// way. An embedding with its own discovery passes it here.
	let dialer = WsDialer::new(FallbackResolver::new(None));

	let sfu = Arc::new(Sfu::new(SfuOptions {
		factory: Arc::new(factory),
		dialer: Some(Arc::new(dialer)),
		camera: None,
	}));

	if !config.servers.is_empty() {
		let running = sfu
			.set_servers(config.servers.clone())
			.await
			.context("failed to apply initial trunk set")?;
		tracing::info!(?running, "initial trunk set applied");
	}

	let app = web::router(sfu.clone(), &config.http_prefix);

	tracing::info!(listen = %config.listen, prefix = %config.http_prefix, "relay listening");

	let listener = tokio::net::TcpListener::bind(config.listen)
		.await
		.context("failed to bind listen address")?;

	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(shutdown())
		.await
		.context("server error")?;

	Ok(())
}

async fn shutdown() {
	tokio::signal::ctrl_c().await.ok();
	tracing::info!("shutting down");
}
