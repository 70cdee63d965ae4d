use std::sync::Arc;

use crate::coding;

/// Error type for the SFU core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// A mailbox was asked to hold more messages than its capacity.
	///
	/// Queues are sized so this never happens in a correct program; it is
	/// surfaced loudly rather than waited on.
	#[error("mailbox full")]
	MailboxFull,

	/// A message was sent to an actor that has already aborted.
	#[error("mailbox aborted")]
	MailboxAborted,

	/// Failed to decode a signalling frame.
	#[error("decode error: {0}")]
	Decode(#[from] coding::DecodeError),

	/// An error from the media transport stack.
	#[error("transport error: {0}")]
	WebRtc(#[from] webrtc::Error),

	/// RTP/RTCP marshalling error.
	#[error("packet error: {0}")]
	Packet(#[from] webrtc::util::Error),

	/// JSON serialization/deserialization error.
	#[error("json error: {0}")]
	Json(Arc<serde_json::Error>),

	/// The signalling channel is closed.
	#[error("signalling channel closed")]
	SignalClosed,

	/// Failed to establish an outbound signalling channel.
	#[error("dial failed: {0}")]
	Dial(String),

	/// A sender handle from a different session implementation.
	#[error("foreign sender handle")]
	ForeignSender,

	/// The remote media source is gone.
	#[error("media source closed")]
	SourceClosed,

	/// Hostname resolution failed.
	#[error("resolve failed: {0}")]
	Resolve(String),

	/// No camera connector was configured for an RTSP trunk.
	#[error("camera connector unavailable")]
	CameraUnavailable,

	/// The camera stream ended or refused the request.
	#[error("camera error: {0}")]
	Camera(String),
}

/// A Result type alias for SFU operations.
pub type Result<T> = std::result::Result<T, Error>;

// Wrap in an Arc so the error stays cheap to pass around
impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Error::Json(Arc::new(err))
	}
}
