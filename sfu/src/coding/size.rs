use std::mem::MaybeUninit;

use bytes::{buf::UninitSlice, Buf, BufMut};

// A BufMut implementation that only counts the size of the buffer.
// Used to compute the size prefix before encoding a message for real.
#[derive(Default)]
pub struct Sizer {
	pub size: usize,
}

unsafe impl BufMut for Sizer {
	unsafe fn advance_mut(&mut self, cnt: usize) {
		self.size += cnt;
	}

	fn chunk_mut(&mut self) -> &mut UninitSlice {
		// We need to return a valid slice, but it won't actually be read back.
		// Use a thread-local scratch buffer to avoid safety issues.
		thread_local! {
			static SCRATCH: std::cell::UnsafeCell<[MaybeUninit<u8>; 1024]> =
				const { std::cell::UnsafeCell::new([MaybeUninit::uninit(); 1024]) };
		}

		SCRATCH.with(|buf| {
			let ptr = buf.get();
			unsafe {
				let slice = (*ptr).as_mut_ptr();
				UninitSlice::from_raw_parts_mut(slice as *mut u8, 1024)
			}
		})
	}

	fn remaining_mut(&self) -> usize {
		usize::MAX
	}

	fn has_remaining_mut(&self) -> bool {
		true
	}

	fn put<T: Buf>(&mut self, mut src: T) {
		self.size += src.remaining();
		src.advance(src.remaining());
	}

	fn put_slice(&mut self, src: &[u8]) {
		self.size += src.len();
	}

	fn put_bytes(&mut self, _val: u8, cnt: usize) {
		self.size += cnt;
	}
}
