use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;

use umbrella_sfu::{CurrentServers, Error, Sfu, SfuStatus, SignalConnection, SignalSink, SignalStream};

pub fn router(sfu: Arc<Sfu>, prefix: &str) -> Router {
	let routes = Router::new()
		.route("/", get(index))
		.route("/status", get(status))
		.route("/servers", get(servers).post(set_servers))
		.route("/signal", get(signal))
		.layer(CorsLayer::permissive())
		.with_state(sfu);

	match prefix {
		"" => routes,
		prefix => Router::new().nest(prefix, routes),
	}
}

async fn index() -> axum::response::Html<&'static str> {
	axum::response::Html(
		"<html><body><h1>umbrella relay</h1>\
		 <p><a href=\"status\">status</a> · <a href=\"servers\">servers</a> · \
		 signalling at <code>/signal</code></p></body></html>",
	)
}

async fn status(State(sfu): State<Arc<Sfu>>) -> Result<Json<SfuStatus>, AppError> {
	Ok(Json(sfu.status().await?))
}

async fn servers(State(sfu): State<Arc<Sfu>>) -> Result<Json<CurrentServers>, AppError> {
	Ok(Json(CurrentServers {
		servers: sfu.servers().await?,
	}))
}

async fn set_servers(
	State(sfu): State<Arc<Sfu>>,
	Json(update): Json<CurrentServers>,
) -> Result<Json<CurrentServers>, AppError> {
	Ok(Json(CurrentServers {
		servers: sfu.set_servers(update.servers).await?,
	}))
}

async fn signal(
	State(sfu): State<Arc<Sfu>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	upgrade: WebSocketUpgrade,
) -> Response {
	upgrade.on_upgrade(move |socket| accept_signalling(sfu, addr, socket))
}

async fn accept_signalling(sfu: Arc<Sfu>, addr: SocketAddr, socket: WebSocket) {
	let (sink, stream) = socket.split();

	let connection = SignalConnection {
		sink: Box::new(WsSink { sink }),
		stream: Box::new(WsStream { stream }),
	};

	let label = format!("client from {addr}");
	if let Err(err) = sfu.accept(&label, connection).await {
		tracing::error!(%addr, ?err, "failed to accept participant");
	}
}

struct AppError(Error);

impl From<Error> for AppError {
	fn from(err: Error) -> Self {
		Self(err)
	}
}

impl IntoResponse for AppError {
	fn into_response(self) -> Response {
		(StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
	}
}

struct WsSink {
	sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SignalSink for WsSink {
	async fn send(&mut self, frame: Bytes) -> umbrella_sfu::Result<()> {
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
	stream: SplitStream<WebSocket>,
}

#[async_trait]
impl SignalStream for WsStream {
	async fn recv(&mut self) -> umbrella_sfu::Result<Option<Bytes>> {
		loop {
			return match self.stream.next().await {
				None => Ok(None),
				Some(Err(_)) => Err(Error::SignalClosed),
				Some(Ok(Message::Binary(frame))) => Ok(Some(frame)),
				Some(Ok(Message::Close(_))) => Ok(None),
				// Pings and pongs are handled by the library; text is noise.
				Some(Ok(_)) => continue,
			};
		}
	}
}
