#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("unexpected end of buffer")]
	UnexpectedEnd,

	#[error("invalid string")]
	InvalidString(#[from] std::str::Utf8Error),

	#[error("invalid value")]
	InvalidValue,

	#[error("unknown frame tag: {0}")]
	UnknownTag(u64),

	#[error("too many bytes")]
	TooManyBytes,
}

pub trait Decode: Sized {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError>;
}

impl Decode for u8 {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		if buf.remaining() < 1 {
			return Err(DecodeError::UnexpectedEnd);
		}

		Ok(buf.get_u8())
	}
}

impl Decode for u64 {
	// Variable length integer with a 2-bit length prefix.
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let first = u8::decode(buf)?;
		let remain = match first >> 6 {
			0b00 => return Ok(first as u64),
			0b01 => 1,
			0b10 => 3,
			0b11 => 7,
			_ => unreachable!(),
		};

		if buf.remaining() < remain {
			return Err(DecodeError::UnexpectedEnd);
		}

		let mut v = (first & 0b0011_1111) as u64;
		for _ in 0..remain {
			v = (v << 8) | buf.get_u8() as u64;
		}

		Ok(v)
	}
}

impl Decode for usize {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		u64::decode(buf)?.try_into().map_err(|_| DecodeError::InvalidValue)
	}
}

impl Decode for bool {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		match u8::decode(buf)? {
			0 => Ok(false),
			1 => Ok(true),
			_ => Err(DecodeError::InvalidValue),
		}
	}
}

impl Decode for String {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let size = usize::decode(buf)?;
		if buf.remaining() < size {
			return Err(DecodeError::UnexpectedEnd);
		}

		let mut bytes = vec![0; size];
		buf.copy_to_slice(&mut bytes);

		String::from_utf8(bytes).map_err(|err| err.utf8_error().into())
	}
}

impl<T: Decode> Decode for Vec<T> {
	fn decode<B: bytes::Buf>(buf: &mut B) -> Result<Self, DecodeError> {
		let count = usize::decode(buf)?;

		// Don't allocate more than 1024 elements upfront
		let mut items = Vec::with_capacity(count.min(1024));
		for _ in 0..count {
			items.push(T::decode(buf)?);
		}

		Ok(items)
	}
}
