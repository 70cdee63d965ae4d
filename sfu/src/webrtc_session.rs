use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::marshal::Marshal;

use crate::{
	Error, MediaSender, MediaSession, RelaySink, RemoteMedia, Result, SessionEvent, SessionEventSink, SessionFactory,
	SessionStatus, TrackKind, TransceiverDirection,
};

fn codec_type(kind: TrackKind) -> RTPCodecType {
	match kind {
		TrackKind::Audio => RTPCodecType::Audio,
		TrackKind::Video => RTPCodecType::Video,
		TrackKind::Unknown => RTPCodecType::Unspecified,
	}
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
	match kind {
		RTPCodecType::Audio => TrackKind::Audio,
		RTPCodecType::Video => TrackKind::Video,
		_ => TrackKind::Unknown,
	}
}

/// Creates peer connections backed by the webrtc stack.
pub struct WebRtcSessionFactory {
	api: API,
	config: RTCConfiguration,
}

impl WebRtcSessionFactory {
	pub fn new(min_port: u16, max_port: u16, public_ip: Option<IpAddr>) -> Result<Self> {
		let mut media = MediaEngine::default();
		media.register_default_codecs()?;

		// Default NACK/SR/RR handling for everything we don't do ourselves.
		let registry = register_default_interceptors(Registry::new(), &mut media)?;

		let mut setting = SettingEngine::default();
		setting.set_udp_network(UDPNetwork::Ephemeral(
			EphemeralUDP::new(min_port, max_port).map_err(webrtc::Error::from)?,
		));

		if let Some(ip) = public_ip {
			setting.set_nat_1to1_ips(vec![ip.to_string()], RTCIceCandidateType::Host);
		}

		let api = APIBuilder::new()
			.with_media_engine(media)
			.with_interceptor_registry(registry)
			.with_setting_engine(setting)
			.build();

		let config = RTCConfiguration {
			ice_servers: vec![RTCIceServer {
				urls: vec!["stun:stun.l.google.com:19302".to_string()],
				..Default::default()
			}],
			..Default::default()
		};

		Ok(Self { api, config })
	}
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
	async fn create(&self, label: &str, events: SessionEventSink) -> Result<Arc<dyn MediaSession>> {
		let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

		let sink = events.clone();
		pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
			let sink = sink.clone();
			Box::pin(async move {
				let Some(candidate) = candidate else { return };

				// Serialize via to_json, which carries the sdpMid correctly.
				let json = candidate.to_json().map(|init| serde_json::to_string(&init));
				match json {
					Ok(Ok(json)) => sink(SessionEvent::Candidate(json)),
					Ok(Err(err)) => tracing::warn!(?err, "failed to serialize candidate"),
					Err(err) => tracing::warn!(?err, "failed to convert candidate"),
				}
			})
		}));

		let sink = events.clone();
		pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
			let sink = sink.clone();
			Box::pin(async move {
				let terminal = matches!(
					state,
					RTCPeerConnectionState::Closed
						| RTCPeerConnectionState::Disconnected
						| RTCPeerConnectionState::Failed
				);
				sink(SessionEvent::ConnectionChanged { terminal });
			})
		}));

		let sink = events.clone();
		pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
			let sink = sink.clone();
			Box::pin(async move {
				if state == RTCSignalingState::Stable {
					sink(SessionEvent::SignalingStable);
				}
			})
		}));

		let sink = events.clone();
		pc.on_negotiation_needed(Box::new(move || {
			let sink = sink.clone();
			Box::pin(async move {
				sink(SessionEvent::NegotiationNeeded);
			})
		}));

		let sink = events.clone();
		pc.on_track(Box::new(
			move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, transceiver: Arc<RTCRtpTransceiver>| {
				let sink = sink.clone();
				Box::pin(async move {
					sink(SessionEvent::TrackReceived(Arc::new(WebRtcRemote {
						track,
						receiver,
						transceiver,
					})));
				})
			},
		));

		Ok(Arc::new(WebRtcSession {
			label: label.to_string(),
			pc,
		}))
	}
}

struct WebRtcSession {
	label: String,
	pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
	async fn create_offer(&self) -> Result<String> {
		let offer = self.pc.create_offer(None).await?;
		Ok(serde_json::to_string(&offer)?)
	}

	async fn create_answer(&self) -> Result<String> {
		let answer = self.pc.create_answer(None).await?;
		Ok(serde_json::to_string(&answer)?)
	}

	async fn set_local_description(&self, sdp: &str) -> Result<()> {
		let desc: RTCSessionDescription = serde_json::from_str(sdp)?;
		self.pc.set_local_description(desc).await?;
		Ok(())
	}

	async fn set_remote_description(&self, sdp: &str) -> Result<()> {
		let desc: RTCSessionDescription = serde_json::from_str(sdp)?;
		self.pc.set_remote_description(desc).await?;
		Ok(())
	}

	async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
		let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
		self.pc.add_ice_candidate(init).await?;
		Ok(())
	}

	async fn create_data_channel(&self, label: &str) -> Result<()> {
		self.pc
			.create_data_channel(
				label,
				Some(RTCDataChannelInit {
					ordered: Some(false),
					..Default::default()
				}),
			)
			.await?;
		Ok(())
	}

	async fn add_transceiver(&self, kind: TrackKind, direction: TransceiverDirection) -> Result<()> {
		let direction = match direction {
			TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
			TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
		};

		self.pc
			.add_transceiver_from_kind(
				codec_type(kind),
				Some(RTCRtpTransceiverInit {
					direction,
					send_encodings: vec![],
				}),
			)
			.await?;
		Ok(())
	}

	async fn add_sender(&self, relay: &RelaySink) -> Result<Arc<dyn MediaSender>> {
		let sender = self
			.pc
			.add_track(relay.local() as Arc<dyn TrackLocal + Send + Sync>)
			.await?;
		Ok(Arc::new(WebRtcSender { sender }))
	}

	async fn remove_sender(&self, sender: &Arc<dyn MediaSender>) -> Result<()> {
		let sender = sender
			.as_any()
			.downcast_ref::<WebRtcSender>()
			.ok_or(Error::ForeignSender)?;
		self.pc.remove_track(&sender.sender).await?;
		Ok(())
	}

	async fn sender_mid(&self, sender: &Arc<dyn MediaSender>) -> Option<String> {
		let sender = sender.as_any().downcast_ref::<WebRtcSender>()?;

		for transceiver in self.pc.get_transceivers().await {
			if Arc::ptr_eq(&transceiver.sender().await, &sender.sender) {
				if let Some(mid) = transceiver.mid() {
					if !mid.is_empty() {
						return Some(mid.to_string());
					}
				}
			}
		}

		None
	}

	fn signaling_stable(&self) -> bool {
		self.pc.signaling_state() == RTCSignalingState::Stable
	}

	fn is_terminated(&self) -> bool {
		matches!(
			self.pc.connection_state(),
			RTCPeerConnectionState::Closed | RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed
		)
	}

	async fn request_keyframes(&self) {
		for receiver in self.pc.get_receivers().await {
			if let Some(track) = receiver.tracks().await.first() {
				let pli = PictureLossIndication {
					sender_ssrc: 0,
					media_ssrc: track.ssrc(),
				};
				if let Err(err) = self.pc.write_rtcp(&[Box::new(pli)]).await {
					tracing::debug!(label = %self.label, ?err, "keyframe request failed");
				}
			}
		}
	}

	async fn write_rtcp(&self, packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) -> Result<()> {
		self.pc.write_rtcp(packets).await?;
		Ok(())
	}

	async fn status(&self) -> SessionStatus {
		SessionStatus {
			connection_state: self.pc.connection_state().to_string(),
			signaling_state: self.pc.signaling_state().to_string(),
			ice_connection_state: self.pc.ice_connection_state().to_string(),
			ice_gathering_state: self.pc.ice_gathering_state().to_string(),
			transceivers: self.pc.get_transceivers().await.len(),
			senders: self.pc.get_senders().await.len(),
			receivers: self.pc.get_receivers().await.len(),
		}
	}

	async fn close(&self) -> Result<()> {
		tracing::info!(label = %self.label, "closing");
		self.pc.close().await?;
		Ok(())
	}
}

struct WebRtcSender {
	sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl MediaSender for WebRtcSender {
	async fn has_track(&self) -> bool {
		self.sender.track().await.is_some()
	}

	async fn track_id(&self) -> Option<String> {
		self.sender.track().await.map(|track| track.id().to_string())
	}

	fn as_any(&self) -> &(dyn Any + Send + Sync) {
		self
	}
}

struct WebRtcRemote {
	track: Arc<TrackRemote>,
	receiver: Arc<RTCRtpReceiver>,
	transceiver: Arc<RTCRtpTransceiver>,
}

#[async_trait]
impl RemoteMedia for WebRtcRemote {
	fn id(&self) -> String {
		self.track.id()
	}

	fn stream_id(&self) -> String {
		self.track.stream_id()
	}

	fn kind(&self) -> TrackKind {
		track_kind(self.track.kind())
	}

	fn ssrc(&self) -> u32 {
		self.track.ssrc()
	}

	fn rtx_ssrc(&self) -> Option<u32> {
		// The stack does not surface a separate retransmission SSRC.
		None
	}

	fn mid(&self) -> Option<String> {
		let mid = self.transceiver.mid()?;
		if mid.is_empty() {
			None
		} else {
			Some(mid.to_string())
		}
	}

	fn codec(&self) -> RTCRtpCodecCapability {
		self.track.codec().capability
	}

	async fn read(&self, buf: &mut [u8]) -> Result<usize> {
		let (packet, _attributes) = self.track.read(buf).await?;
		let len = packet.marshal_to(buf)?;
		Ok(len)
	}

	async fn read_rtcp(&self) -> Result<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>> {
		let (packets, _attributes) = self.receiver.read_rtcp().await?;
		Ok(packets)
	}
}
