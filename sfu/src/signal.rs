use bytes::{Buf, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::coding::*;

/// The kind of media carried by a track.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
	#[default]
	Unknown = 0,
	Audio = 1,
	Video = 2,
}

impl Encode for TrackKind {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		u8::from(*self).encode(w)
	}
}

impl Decode for TrackKind {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		TrackKind::try_from(u8::decode(buf)?).map_err(|_| DecodeError::InvalidValue)
	}
}

/// The mesh-wide identity of a media track.
///
/// The umbrella id is assigned once at the origin node and is the only
/// identifier that survives renegotiation; the transport-level `id` and
/// `stream_id` are discovered per session and may change.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TrackDescriptor {
	pub umbrella_id: String,
	pub kind: TrackKind,
	pub id: String,
	pub stream_id: String,
}

impl Message for TrackDescriptor {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.umbrella_id.encode(w);
		self.kind.encode(w);
		self.id.encode(w);
		self.stream_id.encode(w);
	}

	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		Ok(Self {
			umbrella_id: String::decode(buf)?,
			kind: TrackKind::decode(buf)?,
			id: String::decode(buf)?,
			stream_id: String::decode(buf)?,
		})
	}
}

/// Binding of a session-level media id to an umbrella id.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MidMapping {
	pub mid: String,
	pub umbrella_id: String,
}

impl Message for MidMapping {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.mid.encode(w);
		self.umbrella_id.encode(w);
	}

	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		Ok(Self {
			mid: String::decode(buf)?,
			umbrella_id: String::decode(buf)?,
		})
	}
}

/// Determines the signal that follows.
#[derive(Clone, Copy, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum SignalTag {
	Offer = 1,
	Answer = 2,
	IceCandidate = 3,
	UpstreamTracks = 4,
	AcceptTracks = 5,
	MidMappings = 6,
}

/// A single signalling message, exchanged as length-delimited binary frames.
///
/// SDP and ICE candidate bodies are carried as JSON strings so the transport
/// stack's own serialization round-trips unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
	/// Apply to the receiver's inbound session and reply with an answer.
	Offer { sdp: String },
	/// Apply to the receiver's outbound session.
	Answer { sdp: String },
	/// Trickle ICE candidate. `incoming` is from the SENDER's perspective
	/// and must be inverted on receive.
	IceCandidate { candidate: String, incoming: bool },
	/// The sender announces the tracks it intends to publish.
	UpstreamTracks { tracks: Vec<TrackDescriptor> },
	/// The sender acknowledges the tracks it will receive.
	AcceptTracks { tracks: Vec<TrackDescriptor> },
	/// Authoritative mid bindings for the receiver's inbound session.
	MidMappings { mappings: Vec<MidMapping> },
}

impl Message for Signal {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		match self {
			Self::Offer { sdp } => {
				u8::from(SignalTag::Offer).encode(w);
				sdp.encode(w);
			}
			Self::Answer { sdp } => {
				u8::from(SignalTag::Answer).encode(w);
				sdp.encode(w);
			}
			Self::IceCandidate { candidate, incoming } => {
				u8::from(SignalTag::IceCandidate).encode(w);
				candidate.encode(w);
				incoming.encode(w);
			}
			Self::UpstreamTracks { tracks } => {
				u8::from(SignalTag::UpstreamTracks).encode(w);
				tracks.encode(w);
			}
			Self::AcceptTracks { tracks } => {
				u8::from(SignalTag::AcceptTracks).encode(w);
				tracks.encode(w);
			}
			Self::MidMappings { mappings } => {
				u8::from(SignalTag::MidMappings).encode(w);
				mappings.encode(w);
			}
		}
	}

	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let tag = u8::decode(buf)?;
		let tag = SignalTag::try_from(tag).map_err(|_| DecodeError::UnknownTag(tag as u64))?;

		Ok(match tag {
			SignalTag::Offer => Self::Offer {
				sdp: String::decode(buf)?,
			},
			SignalTag::Answer => Self::Answer {
				sdp: String::decode(buf)?,
			},
			SignalTag::IceCandidate => Self::IceCandidate {
				candidate: String::decode(buf)?,
				incoming: bool::decode(buf)?,
			},
			SignalTag::UpstreamTracks => Self::UpstreamTracks {
				tracks: Vec::decode(buf)?,
			},
			SignalTag::AcceptTracks => Self::AcceptTracks {
				tracks: Vec::decode(buf)?,
			},
			SignalTag::MidMappings => Self::MidMappings {
				mappings: Vec::decode(buf)?,
			},
		})
	}
}

impl Signal {
	/// Encode to a single size-prefixed frame.
	pub fn to_frame(&self) -> Bytes {
		let mut buf = Vec::new();
		Encode::encode(self, &mut buf);
		buf.into()
	}

	/// Decode a single size-prefixed frame.
	pub fn from_frame(frame: &[u8]) -> Result<Self, DecodeError> {
		let mut buf = frame;
		Decode::decode(&mut buf)
	}
}

/// Outbound half of a signalling channel. Frames are already
/// length-delimited; the channel only needs to carry them whole.
#[async_trait::async_trait]
pub trait SignalSink: Send + Sync {
	async fn send(&mut self, frame: Bytes) -> crate::Result<()>;
	async fn close(&mut self);
}

/// Inbound half of a signalling channel. Returns None on clean close.
#[async_trait::async_trait]
pub trait SignalStream: Send {
	async fn recv(&mut self) -> crate::Result<Option<Bytes>>;
}

/// A connected signalling channel, split so the writer lives on the
/// participant actor while a reader task drains the stream.
pub struct SignalConnection {
	pub sink: Box<dyn SignalSink>,
	pub stream: Box<dyn SignalStream>,
}

/// Establishes outbound signalling channels for trunk participants.
#[async_trait::async_trait]
pub trait SignalDialer: Send + Sync {
	async fn dial(&self, url: &url::Url) -> crate::Result<SignalConnection>;
}
