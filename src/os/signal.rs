#![allow(clippy::module_name_repetitions)]

use std::mem::zeroed;

use num_derive::FromPrimitive;

use super::error::{result_from_code, result_from_libc, OsResult};

/// The signals the runtime deals in, by Linux number.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, FromPrimitive)]
#[repr(i32)]
pub enum Signal {
	/// Interrupt from keyboard, ^C
	Interrupt = 2,

	/// Abnormal termination
	Abort = 6,

	/// Forced process termination
	Kill = 9,

	/// User-defined signal 1
	User1 = 10,

	/// User-defined signal 2
	User2 = 12,

	/// Real-timer clock
	Alarm = 14,

	/// Process termination
	Termination = 15,

	/// Resume execution, if stopped
	Continue = 18,

	/// Urgent condition on socket
	Urgent = 23,

	/// Virtual timer expired
	VirtualAlarm = 26,

	/// Profiling timer expired
	Profile = 27
}

impl Signal {
	pub const fn raw(self) -> i32 {
		self as i32
	}
}

pub type RawHandler = extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void);

fn set_of(signal: Signal) -> libc::sigset_t {
	/* Safety: sigset_t is plain data, initialized right below */
	let mut set = unsafe { zeroed() };

	/* Safety: set is a valid sigset */
	unsafe {
		libc::sigemptyset(&mut set);
		libc::sigaddset(&mut set, signal.raw());
	}

	set
}

/// Install `handler` for `signal`, process wide, dispatched with siginfo
/// on the installing thread's alternate stack.
pub fn install_handler(signal: Signal, handler: RawHandler) -> OsResult<()> {
	/* Safety: sigaction is plain data, fields set below */
	let mut action: libc::sigaction = unsafe { zeroed() };

	action.sa_sigaction = handler as usize;
	action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESTART;

	/* Safety: sa_mask is a valid sigset */
	unsafe { libc::sigemptyset(&mut action.sa_mask) };

	/* Safety: action is fully initialized */
	result_from_libc(unsafe {
		libc::sigaction(signal.raw(), &action, std::ptr::null_mut())
	} as isize)?;

	Ok(())
}

/// Point this thread's signal stack at `base..base + length`.
pub fn install_alt_stack(base: *mut u8, length: usize) -> OsResult<()> {
	let stack = libc::stack_t {
		ss_sp: base.cast(),
		ss_flags: 0,
		ss_size: length
	};

	/* Safety: stack describes a live mapping owned by the caller */
	result_from_libc(unsafe { libc::sigaltstack(&stack, std::ptr::null_mut()) } as isize)?;

	Ok(())
}

/// Block `signal` on the calling thread, returning the previous mask.
pub fn block(signal: Signal) -> OsResult<libc::sigset_t> {
	let set = set_of(signal);

	/* Safety: old is written before it is read */
	let mut old = unsafe { zeroed() };

	/* Safety: both sets are valid */
	result_from_code(unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old) })?;

	Ok(old)
}

/// Unblock `signal` on the calling thread.
pub fn unblock(signal: Signal) -> OsResult<()> {
	let set = set_of(signal);

	/* Safety: set is valid */
	result_from_code(unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) })
}

/// Reinstate a mask previously returned by [`block`].
pub fn restore_mask(mask: &libc::sigset_t) -> OsResult<()> {
	/* Safety: mask came from pthread_sigmask */
	result_from_code(unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, mask, std::ptr::null_mut()) })
}

/// Discard any pending instance of `signal` on this thread.
///
/// The signal must currently be blocked; a stale delivery consumed here
/// would otherwise fire the moment the thread unblocks.
pub fn consume_pending(signal: Signal) -> OsResult<()> {
	let set = set_of(signal);
	let none = libc::timespec { tv_sec: 0, tv_nsec: 0 };

	loop {
		/* Safety: all three pointers are valid for the call */
		let result =
			unsafe { libc::sigtimedwait(&set, std::ptr::null_mut(), &none) };

		if result == signal.raw() {
			continue;
		}

		let err = std::io::Error::last_os_error();

		return match err.raw_os_error() {
			Some(libc::EAGAIN) => Ok(()),
			Some(libc::EINTR) => continue,
			_ => Err(err)
		};
	}
}

/// Deliver `signal` to one specific thread.
pub fn thread_kill(thread: libc::pthread_t, signal: Signal) -> OsResult<()> {
	/* Safety: a stale id can produce ESRCH, never a wild write */
	result_from_code(unsafe { libc::pthread_kill(thread, signal.raw()) })
}

/// Deliver `signal` to the calling thread.
pub fn raise_self(signal: Signal) -> OsResult<()> {
	/* Safety: own thread id is always valid */
	thread_kill(unsafe { libc::pthread_self() }, signal)
}
