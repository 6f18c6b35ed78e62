use enumflags2::{bitflags, BitFlags};

use super::error::OsResult;

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Protection {
	Read  = 1 << 0,
	Write = 1 << 1,
	Exec  = 1 << 2
}

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Flag {
	Private   = 1 << 1,
	Anonymous = 1 << 5,
	Stack     = 1 << 17
}

/// An owned anonymous mapping. Unmapped on drop.
pub struct Map {
	addr: *mut u8,
	length: usize
}

/* Safety: the mapping is owned and process-wide */
unsafe impl Send for Map {}

/* Safety: the struct itself is only addresses */
unsafe impl Sync for Map {}

impl Map {
	pub fn map(length: usize, prot: BitFlags<Protection>, flags: BitFlags<Flag>) -> OsResult<Self> {
		/* Safety: anonymous mapping, no fd */
		let addr = unsafe {
			libc::mmap(
				std::ptr::null_mut(),
				length,
				prot.bits() as i32,
				flags.bits() as i32,
				-1,
				0
			)
		};

		if addr == libc::MAP_FAILED {
			return Err(std::io::Error::last_os_error());
		}

		Ok(Self { addr: addr.cast(), length })
	}

	/// Map a region suitable for a thread or fiber stack.
	pub fn stack(length: usize) -> OsResult<Self> {
		Self::map(
			length,
			Protection::Read | Protection::Write,
			Flag::Private | Flag::Anonymous | Flag::Stack
		)
	}

	pub fn addr(&self) -> *mut u8 {
		self.addr
	}

	pub fn length(&self) -> usize {
		self.length
	}
}

impl Drop for Map {
	fn drop(&mut self) {
		/* Safety: mapped in `map`, never unmapped elsewhere */
		let result = unsafe { libc::munmap(self.addr.cast(), self.length) };

		debug_assert_eq!(result, 0);
	}
}
