use bytes::{Buf, BufMut};

use super::{Decode, DecodeError, Encode, Sizer};

/// A size-prefixed unit of the signalling wire format.
///
/// Implementors describe only their body; the prefix is handled here. On
/// encode, the body is measured with a [Sizer] first so the varint length
/// can be written ahead of it. On decode, the body is confined to exactly
/// the prefixed length: a frame that reads past its prefix corrupts every
/// frame behind it on the channel, and one that leaves bytes behind was
/// produced by a peer we disagree with — both are rejected rather than
/// resynchronized.
pub trait Message: Sized {
	fn encode<W: BufMut>(&self, w: &mut W);

	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError>;
}

// Every message is encodable/decodable with its size prefix attached.
impl<T: Message> Encode for T {
	fn encode<W: BufMut>(&self, w: &mut W) {
		let mut sizer = Sizer::default();
		Message::encode(self, &mut sizer);
		sizer.size.encode(w);
		Message::encode(self, w);
	}
}

impl<T: Message> Decode for T {
	fn decode<B: Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let size = usize::decode(buf)?;

		// The prefix is peer-controlled; never trust it past the bytes we
		// actually hold.
		if buf.remaining() < size {
			return Err(DecodeError::UnexpectedEnd);
		}

		let mut body = buf.take(size);
		let message = Message::decode(&mut body)?;
		if body.remaining() > 0 {
			return Err(DecodeError::TooManyBytes);
		}

		Ok(message)
	}
}
