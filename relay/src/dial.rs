use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use umbrella_sfu::{
	Error, FallbackResolver, Resolve, Result, SignalConnection, SignalDialer, SignalSink, SignalStream,
};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Dials trunk peers over WebSocket, resolving `.local` names through the
/// discovery seam first.
pub struct WsDialer {
	resolver: FallbackResolver,
}

impl WsDialer {
	pub fn new(resolver: FallbackResolver) -> Self {
		Self { resolver }
	}
}

#[async_trait]
impl SignalDialer for WsDialer {
	async fn dial(&self, url: &Url) -> Result<SignalConnection> {
		let mut url = url.clone();

		// Mesh peers advertise .local names the system resolver may not see.
		if let Some(host) = url.host_str() {
			if host.ends_with(".local") {
				match self.resolver.resolve(host).await {
					Ok(addr) => {
						let _ = url.set_ip_host(addr);
					}
					Err(err) => tracing::debug!(%host, ?err, "discovery failed, dialing as-is"),
				}
			}
		}

		let (socket, _response) = connect_async(url.as_str())
			.await
			.map_err(|err| Error::Dial(err.to_string()))?;

		let (sink, stream) = socket.split();

		Ok(SignalConnection {
			sink: Box::new(WsSink { sink }),
			stream: Box::new(WsStream { stream }),
		})
	}
}

struct WsSink {
	sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl SignalSink for WsSink {
	async fn send(&mut self, frame: Bytes) -> Result<()> {
		self.sink
			.send(Message::Binary(frame))
			.await
			.map_err(|_| Error::SignalClosed)
	}

	async fn close(&mut self) {
		self.sink.close().await.ok();
	}
}

struct WsStream {
	stream: SplitStream<Socket>,
}

#[async_trait]
impl SignalStream for WsStream {
	async fn recv(&mut self) -> Result<Option<Bytes>> {
		loop {
			return match self.stream.next().await {
				None => Ok(None),
				Some(Err(_)) => Err(Error::SignalClosed),
				Some(Ok(Message::Binary(frame))) => Ok(Some(frame)),
				Some(Ok(Message::Close(_))) => Ok(None),
				Some(Ok(_)) => continue,
			};
		}
	}
}
