use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Duration;
use url::Url;
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::actor::{self, Actor, Mailbox, Tagged};
use crate::{ControllerHandle, Error, IncomingTrack, ParticipantId, RelaySink, Result, TrackDescriptor, TrackKind};

// Camera trunks see little traffic beyond their own lifecycle.
const MAILBOX_CAPACITY: usize = 16;

const REDIAL: Duration = Duration::from_secs(5);

// Cameras rarely volunteer keyframes, so ask on a slow tick.
const KEYFRAME_TICK: Duration = Duration::from_secs(12);

/// A connected camera: a stream of RTP packets plus a control handle for
/// keyframe requests.
pub struct CameraFeed {
	pub packets: mpsc::Receiver<rtp::packet::Packet>,
	pub control: Box<dyn CameraControl>,
}

/// The streaming-camera client library, consumed behind this seam.
#[async_trait]
pub trait CameraConnector: Send + Sync {
	async fn connect(&self, url: &Url) -> Result<CameraFeed>;
}

#[async_trait]
pub trait CameraControl: Send + Sync {
	async fn request_keyframe(&self) -> Result<()>;
	async fn close(&self);
}

pub enum CameraEvent {
	Dial,
	/// The packet stream ended; tear down and redial.
	Disconnected,
	Stop,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CameraTag {
	Dial,
	Disconnected,
	Stop,
}

impl Tagged for CameraEvent {
	type Tag = CameraTag;

	fn tag(&self) -> CameraTag {
		match self {
			Self::Dial => CameraTag::Dial,
			Self::Disconnected => CameraTag::Disconnected,
			Self::Stop => CameraTag::Stop,
		}
	}
}

/// Cloneable address of a camera trunk actor.
#[derive(Clone)]
pub struct CameraHandle {
	id: ParticipantId,
	label: String,
	mailbox: Mailbox<CameraEvent>,
}

impl CameraHandle {
	pub fn id(&self) -> ParticipantId {
		self.id
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn stop(&self) {
		self.mailbox.clear();
		self.mailbox.send(CameraEvent::Stop).ok();
	}
}

struct ActiveFeed {
	track: IncomingTrack,
	control: Arc<dyn CameraControl>,
	reader: tokio::task::JoinHandle<()>,
	ticker: tokio::task::JoinHandle<()>,
}

/// RTSP camera ingest: video only, published into the mesh like any other
/// incoming track.
pub struct CameraTrunk {
	id: ParticipantId,
	label: String,
	url: Url,
	mailbox: Mailbox<CameraEvent>,
	controller: ControllerHandle,
	connector: Arc<dyn CameraConnector>,
	active: Option<ActiveFeed>,
}

impl CameraTrunk {
	pub(crate) fn spawn(
		url: Url,
		controller: ControllerHandle,
		connector: Option<Arc<dyn CameraConnector>>,
	) -> Result<CameraHandle> {
		let connector = connector.ok_or(Error::CameraUnavailable)?;

		let id = ParticipantId::next();
		let label = format!("rtsp ingest from {url}");
		let mailbox = Mailbox::new(&label, MAILBOX_CAPACITY);

		let handle = CameraHandle {
			id,
			label: label.clone(),
			mailbox: mailbox.clone(),
		};

		let trunk = CameraTrunk {
			id,
			label,
			url,
			mailbox: mailbox.clone(),
			controller,
			connector,
			active: None,
		};

		actor::spawn(mailbox.clone(), trunk);
		mailbox.send(CameraEvent::Dial).ok();

		Ok(handle)
	}

	async fn dial(&mut self) {
		if self.active.is_some() {
			return;
		}

		let feed = match self.connector.connect(&self.url).await {
			Ok(feed) => feed,
			Err(err) => {
				tracing::warn!(label = %self.label, ?err, "camera dial failed, retrying");
				self.mailbox.send_in(CameraEvent::Dial, REDIAL).ok();
				return;
			}
		};

		// Video only; the fmtp line matches what browsers negotiate so the
		// relay binds without transcoding.
		let codec = RTCRtpCodecCapability {
			mime_type: MIME_TYPE_H264.to_string(),
			clock_rate: 90000,
			channels: 0,
			sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42001f".to_string(),
			rtcp_feedback: vec![],
		};

		let relay = RelaySink::new(
			codec,
			format!("UMB_RTSP_SRC{}", uuid::Uuid::new_v4()),
			format!("rtsp-src-{}", uuid::Uuid::new_v4()),
		);

		let track = IncomingTrack {
			descriptor: TrackDescriptor {
				umbrella_id: format!("UMB_ID{}", uuid::Uuid::new_v4()),
				kind: TrackKind::Video,
				..Default::default()
			},
			relay: relay.clone(),
		};

		let control: Arc<dyn CameraControl> = Arc::from(feed.control);

		let reader = tokio::spawn(read_packets(feed.packets, relay, self.mailbox.clone()));
		let ticker = tokio::spawn(request_keyframes(control.clone()));

		tracing::info!(label = %self.label, umbrella_id = %track.umbrella_id(), "camera publishing");

		self.active = Some(ActiveFeed {
			track: track.clone(),
			control,
			reader,
			ticker,
		});

		self.controller.add_track(track);
	}

	async fn teardown(&mut self) {
		let Some(active) = self.active.take() else {
			return;
		};

		active.reader.abort();
		active.ticker.abort();
		active.control.close().await;

		self.controller.remove_track(&active.track);
	}
}

async fn read_packets(mut packets: mpsc::Receiver<rtp::packet::Packet>, relay: RelaySink, mailbox: Mailbox<CameraEvent>) {
	while let Some(mut packet) = packets.recv().await {
		packet.header.extension = false;
		packet.header.extension_profile = 0;
		packet.header.extensions.clear();

		if let Err(err) = relay.write_rtp(&packet).await {
			tracing::error!(?err, "error writing camera rtp to relay");
			break;
		}
	}

	mailbox.send(CameraEvent::Disconnected).ok();
}

async fn request_keyframes(control: Arc<dyn CameraControl>) {
	loop {
		tokio::time::sleep(KEYFRAME_TICK).await;

		if control.request_keyframe().await.is_err() {
			return;
		}
	}
}

#[async_trait]
impl Actor for CameraTrunk {
	type Message = CameraEvent;

	async fn handle(&mut self, event: CameraEvent) {
		match event {
			CameraEvent::Dial => self.dial().await,
			CameraEvent::Disconnected => {
				tracing::warn!(label = %self.label, "camera feed ended");
				self.teardown().await;
				self.mailbox.send_in(CameraEvent::Dial, REDIAL).ok();
			}
			CameraEvent::Stop => {
				tracing::info!(label = %self.label, "stopping");
				self.teardown().await;
				self.mailbox.abort();
			}
		}
	}

	async fn cleanup(&mut self) {
		self.teardown().await;
		self.controller.remove_participant(self.id);
	}
}
