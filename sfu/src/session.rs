use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::rtcp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::{RelaySink, Result, SessionStatus, TrackKind};

/// Direction of a transceiver added ahead of negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransceiverDirection {
	SendOnly,
	RecvOnly,
}

/// Events surfaced by a media session to its owning participant.
///
/// These are delivered from transport callbacks and must only enqueue work;
/// the participant reacts on its own actor.
#[derive(Clone)]
pub enum SessionEvent {
	/// A local ICE candidate is ready to trickle to the peer (JSON body).
	Candidate(String),
	/// The connection state changed. `terminal` covers closed, disconnected
	/// and failed.
	ConnectionChanged { terminal: bool },
	/// The signalling state settled back to stable.
	SignalingStable,
	/// The session wants a (re)negotiation.
	NegotiationNeeded,
	/// The transport delivered a new inbound media stream.
	TrackReceived(Arc<dyn RemoteMedia>),
}

pub type SessionEventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// One half of a participant's media transport (inbound or outbound).
///
/// This wraps the ICE/DTLS/SRTP stack; the state machine consumes only this
/// interface, so it can be driven by a scripted session in tests. SDP and
/// candidates are opaque JSON strings that round-trip the stack's own
/// serialization.
#[async_trait]
pub trait MediaSession: Send + Sync {
	async fn create_offer(&self) -> Result<String>;
	async fn create_answer(&self) -> Result<String>;
	async fn set_local_description(&self, sdp: &str) -> Result<()>;
	async fn set_remote_description(&self, sdp: &str) -> Result<()>;
	async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

	async fn create_data_channel(&self, label: &str) -> Result<()>;
	async fn add_transceiver(&self, kind: TrackKind, direction: TransceiverDirection) -> Result<()>;

	/// Bind a relay sink as an outbound sender.
	async fn add_sender(&self, relay: &RelaySink) -> Result<Arc<dyn MediaSender>>;
	async fn remove_sender(&self, sender: &Arc<dyn MediaSender>) -> Result<()>;

	/// The session-level media id of a sender, once negotiation assigns one.
	async fn sender_mid(&self, sender: &Arc<dyn MediaSender>) -> Option<String>;

	fn signaling_stable(&self) -> bool;
	fn is_terminated(&self) -> bool;

	/// Ask every live remote source on this session for a keyframe.
	async fn request_keyframes(&self);

	/// Write RTCP toward the remote peer.
	async fn write_rtcp(&self, packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) -> Result<()>;

	async fn status(&self) -> SessionStatus;
	async fn close(&self) -> Result<()>;
}

/// An outbound sender created by [MediaSession::add_sender].
#[async_trait]
pub trait MediaSender: Send + Sync {
	async fn has_track(&self) -> bool;
	async fn track_id(&self) -> Option<String>;

	fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// An inbound media stream delivered by the transport, together with its
/// receiver handle.
#[async_trait]
pub trait RemoteMedia: Send + Sync {
	fn id(&self) -> String;
	fn stream_id(&self) -> String;
	fn kind(&self) -> TrackKind;
	fn ssrc(&self) -> u32;
	fn rtx_ssrc(&self) -> Option<u32>;

	/// The negotiated media id, or None while the transceiver has none yet.
	fn mid(&self) -> Option<String>;

	fn codec(&self) -> RTCRtpCodecCapability;

	/// Read one raw RTP datagram into `buf`, returning its length.
	async fn read(&self, buf: &mut [u8]) -> Result<usize>;

	/// Read RTCP from the source (sender reports and friends).
	async fn read_rtcp(&self) -> Result<Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>>;
}

/// Creates media sessions wired to the given event sink.
#[async_trait]
pub trait SessionFactory: Send + Sync {
	async fn create(&self, label: &str, events: SessionEventSink) -> Result<Arc<dyn MediaSession>>;
}
