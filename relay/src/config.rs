use std::net::{IpAddr, SocketAddr};

use clap::Parser;

#[derive(Parser, Clone)]
#[command(name = "umbrella-relay", about = "Selective forwarding unit relay node")]
pub struct Config {
	/// Serve HTTP (signalling, status, control) on this address.
	#[arg(long, env = "UMBRELLA_HTTP_SERVE_ADDR", default_value = "0.0.0.0:8081")]
	pub listen: SocketAddr,

	/// Path prefix when served behind a reverse proxy, e.g. "/umbrella".
	/// The same form as traefik's PathPrefix, so one env var can feed both.
	#[arg(long, env = "UMBRELLA_HTTP_PREFIX", default_value = "")]
	pub http_prefix: String,

	/// Public IP advertised in ICE candidates when running in the cloud.
	#[arg(long, env = "UMBRELLA_PUBLIC_IP")]
	pub public_ip: Option<IpAddr>,

	/// Lower bound of the UDP port range used for media.
	#[arg(long, env = "UMBRELLA_MIN_PORT", default_value_t = 40000)]
	pub min_port: u16,

	/// Upper bound of the UDP port range used for media.
	#[arg(long, env = "UMBRELLA_MAX_PORT", default_value_t = 60000)]
	pub max_port: u16,

	/// Initial trunk set, equivalent to POSTing /servers after startup.
	#[arg(long = "server", env = "UMBRELLA_SERVERS", value_delimiter = ',')]
	pub servers: Vec<String>,

	#[command(flatten)]
	pub log: Log,
}

#[derive(clap::Args, Clone)]
pub struct Log {
	/// Log filter, in RUST_LOG syntax.
	#[arg(long = "log", env = "UMBRELLA_LOG", default_value = "info")]
	pub filter: String,
}

impl Log {
	pub fn init(&self) {
		use tracing_subscriber::EnvFilter;

		let filter = EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"));

		tracing_subscriber::fmt().with_env_filter(filter).init();
	}
}
