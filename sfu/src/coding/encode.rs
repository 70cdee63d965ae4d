pub trait Encode: Sized {
	// Encode the value to the given writer.
	// This will panic if the Buf is not large enough; use a Vec or a Sizer to check.
	fn encode<W: bytes::BufMut>(&self, w: &mut W);
}

impl Encode for u8 {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		w.put_u8(*self);
	}
}

impl Encode for u64 {
	// Variable length integer with a 2-bit length prefix.
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		let v = *self;
		if v < (1 << 6) {
			w.put_u8(v as u8);
		} else if v < (1 << 14) {
			w.put_u16(0b01 << 14 | v as u16);
		} else if v < (1 << 30) {
			w.put_u32(0b10 << 30 | v as u32);
		} else if v < (1 << 62) {
			w.put_u64(0b11 << 62 | v);
		} else {
			panic!("varint too large");
		}
	}
}

impl Encode for usize {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		(*self as u64).encode(w)
	}
}

impl Encode for bool {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		w.put_u8(*self as u8);
	}
}

impl Encode for String {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.as_str().encode(w)
	}
}

impl Encode for &str {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.len().encode(w);
		w.put(self.as_bytes());
	}
}

impl<T: Encode> Encode for Vec<T> {
	fn encode<W: bytes::BufMut>(&self, w: &mut W) {
		self.len().encode(w);
		for item in self.iter() {
			item.encode(w);
		}
	}
}
