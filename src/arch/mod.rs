//! Machine-dependent context support.
//!
//! Each architecture provides:
//!
//! - a `#[repr(C)]` [`RegisterFile`] covering every general-purpose
//!   register user code may hold live, plus stack pointer and program
//!   counter. The asm addresses fields by numeric offset, pinned with
//!   `const_assert_eq!` against `offset_of!`.
//! - [`switch`]: store the caller's callee-saved registers, stack pointer
//!   and return address into `from`, then load `to` and jump. The call
//!   returns when something re-enters `from` — a later [`restore`], or the
//!   preemption path installing it into an interrupted machine context.
//!   Every re-entry lands at the switch call's return site, so from the
//!   compiler's view the call returns exactly once.
//! - [`restore`]: load a file and jump to its program counter without
//!   returning. One scratch register carries the branch target, so this
//!   is only legal for files produced by [`switch`] or fresh entry files,
//!   where that register is dead. Files captured by preemption hold live
//!   scratch registers and are reinstalled through the interrupted
//!   machine context instead ([`install_mcontext`]), which the kernel
//!   applies atomically on signal return.
//! - the fiber entry shim: the entry function pointer is parked in a
//!   reserved slot at the initial stack pointer; the shim pops it, calls
//!   it with the argument registers the file was loaded with, and hands
//!   the returned pointer to `weft_fiber_exit`.
//! - [`capture_mcontext`] / [`install_mcontext`]: copy the register file
//!   out of / into an OS-delivered ucontext.

#[cfg(target_arch = "aarch64")]
mod arm64;
#[cfg(target_arch = "x86_64")]
mod x64;

#[cfg(target_arch = "aarch64")]
pub use arm64::*;
#[cfg(target_arch = "x86_64")]
pub use x64::*;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported architecture: no context-switch backend");

#[cfg(test)]
mod test {
	use super::*;
	use crate::os::mman::Map;

	struct Shared {
		caller: RegisterFile,
		callee: RegisterFile,
		total: u64
	}

	unsafe extern "C" fn accumulate(arg: *mut u8) -> *mut u8 {
		let shared = arg.cast::<Shared>();
		let mut step = 0;

		loop {
			/* Safety: the Shared is owned by the live test frame; raw
			 * access keeps the two flows of control from aliasing */
			unsafe {
				(*shared).total += step;
				step += 1;

				switch(
					std::ptr::addr_of_mut!((*shared).callee),
					std::ptr::addr_of!((*shared).caller)
				);
			}
		}
	}

	#[test]
	fn test_switch_preserves_state() {
		let stack = Map::stack(32 * 1024).unwrap();
		let mut shared = Shared {
			caller: RegisterFile::default(),
			callee: RegisterFile::default(),
			total: 0
		};

		/* Safety: the slot region at the stack top is unused */
		unsafe {
			set_entry(&mut shared.callee, stack.addr(), stack.length(), 0, accumulate as usize);
		}

		let shared_ptr = std::ptr::addr_of_mut!(shared) as u64;
		set_arg(&mut shared.callee, 0, shared_ptr);

		let mut expected = 0;

		for step in 0..10 {
			/* Safety: files and the fiber stack outlive the switches */
			unsafe { switch(&mut shared.caller, &shared.callee) };

			expected += step;

			assert_eq!(shared.total, expected);
		}
	}
}
