use std::fmt;
use std::sync::Arc;

use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::{Result, TrackDescriptor};

/// The local fan-out endpoint for one incoming track.
///
/// The forwarding path writes RTP into the sink; the readers are the
/// outbound senders bound to it across every participant. Cloning shares
/// the same underlying track.
#[derive(Clone)]
pub struct RelaySink {
	local: Arc<TrackLocalStaticRTP>,
}

impl RelaySink {
	pub fn new<I: ToString, S: ToString>(codec: RTCRtpCodecCapability, id: I, stream_id: S) -> Self {
		Self {
			local: Arc::new(TrackLocalStaticRTP::new(codec, id.to_string(), stream_id.to_string())),
		}
	}

	pub async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<()> {
		use webrtc::track::track_local::TrackLocalWriter;

		self.local.write_rtp(packet).await?;
		Ok(())
	}

	/// The underlying local track, for binding as an outbound sender.
	pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
		self.local.clone()
	}
}

/// A track being received by this node and republished to everyone else.
#[derive(Clone)]
pub struct IncomingTrack {
	pub descriptor: TrackDescriptor,
	pub relay: RelaySink,
}

impl IncomingTrack {
	pub fn umbrella_id(&self) -> &str {
		&self.descriptor.umbrella_id
	}
}

impl fmt::Display for IncomingTrack {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{{IncomingTrack id: {}}}", self.descriptor.umbrella_id)
	}
}

/// A track this node intends to publish to one specific participant.
///
/// `advertised` means the descriptor has been announced to the peer;
/// `accepted` means the peer has acknowledged it will receive the track.
pub struct OutgoingTrack {
	pub source: IncomingTrack,
	pub advertised: bool,
	pub accepted: bool,
}

impl OutgoingTrack {
	pub fn new(source: IncomingTrack) -> Self {
		Self {
			source,
			advertised: false,
			accepted: false,
		}
	}

	pub fn umbrella_id(&self) -> &str {
		self.source.umbrella_id()
	}

	pub fn descriptor(&self) -> &TrackDescriptor {
		&self.source.descriptor
	}
}
