use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;

use crate::{Error, Result};

// Discovery answers fast or not at all.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Host resolution for trunk dialing.
///
/// The multicast discovery service implements this; so does plain DNS. Used
/// to find `.local` peers that the system resolver cannot see.
#[async_trait]
pub trait Resolve: Send + Sync {
	async fn resolve(&self, host: &str) -> Result<IpAddr>;
}

/// Resolution through the operating system's DNS.
pub struct DnsResolver;

#[async_trait]
impl Resolve for DnsResolver {
	async fn resolve(&self, host: &str) -> Result<IpAddr> {
		let mut addrs = tokio::net::lookup_host((host, 0))
			.await
			.map_err(|err| Error::Resolve(err.to_string()))?;

		addrs
			.next()
			.map(|addr| addr.ip())
			.ok_or_else(|| Error::Resolve(format!("no addresses for {host}")))
	}
}

/// Queries a primary resolver with a bounded deadline and falls back to DNS
/// when it is absent, slow, or empty-handed.
pub struct FallbackResolver {
	primary: Option<Arc<dyn Resolve>>,
	fallback: DnsResolver,
}

impl FallbackResolver {
	pub fn new(primary: Option<Arc<dyn Resolve>>) -> Self {
		Self {
			primary,
			fallback: DnsResolver,
		}
	}
}

#[async_trait]
impl Resolve for FallbackResolver {
	async fn resolve(&self, host: &str) -> Result<IpAddr> {
		if let Some(primary) = &self.primary {
			match tokio::time::timeout(RESOLVE_TIMEOUT, primary.resolve(host)).await {
				Ok(Ok(addr)) => return Ok(addr),
				Ok(Err(err)) => tracing::debug!(%host, ?err, "primary resolution failed"),
				Err(_) => tracing::debug!(%host, "primary resolution timed out"),
			}
		}

		self.fallback.resolve(host).await
	}
}
