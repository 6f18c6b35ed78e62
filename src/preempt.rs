//! The asynchronous preemption path.
//!
//! Everything in the handler is async-signal-safe: no allocation, no
//! formatting, no I/O. The only lock taken is the worker's own queue
//! spin lock, and the dispatch protocol guarantees the interrupted
//! thread never holds it while the preemption signal is open.

use std::cell::Cell;
use std::sync::atomic::Ordering;

use crate::arch;
use crate::fiber::FiberState;
use crate::os::error::OsResult;
use crate::os::signal::{self, Signal};
use crate::worker::{WorkerState, CURRENT_WORKER};

/// Install the preemption handler for `signal`, process wide.
pub(crate) fn install(signal: Signal) -> OsResult<()> {
	signal::install_handler(signal, preempt_handler)
}

/// Delivered on a worker thread, on its alternate stack. Four cases:
///
/// - a scheduler exit is armed: a finished fiber is handing control back
///   to a fully-captured scheduler context; install it and return.
/// - a resume is armed: the worker is mid-dispatch of a fiber whose
///   register file was captured by an earlier preemption. Save the
///   interrupted scheduler into the worker's main context, rewrite the
///   machine context to the fiber's full file, and let signal return
///   install it. The interrupted mask (signal open) travels with it.
/// - the worker is running a fiber: the time slice expired. Capture the
///   interrupted file into the fiber bit-for-bit, re-admit the fiber at
///   the back of the local queue, and rewrite the machine context to the
///   scheduler's saved state with the signal blocked.
/// - anything else: a stray delivery; do nothing.
extern "C" fn preempt_handler(
	signum: i32, _info: *mut libc::siginfo_t, context: *mut libc::c_void
) {
	let worker = CURRENT_WORKER.with(Cell::get);

	if worker.is_null() {
		/* kernel-generated delivery on a thread outside the pool */
		return;
	}

	/* Safety: worker threads outlive the runtime's signal traffic */
	let worker = unsafe { &*worker };

	if worker.exit_to_main.swap(false, Ordering::SeqCst) {
		/* a finished fiber is routing control back to a scheduler
		 * context that only the kernel may reinstall; the interrupted
		 * state is the dead fiber's epilogue and is discarded */
		unsafe {
			arch::install_mcontext(context, &*worker.main_file.get());

			block_in_context(context, signum);
		}

		return;
	}

	let target = worker
		.resume_target
		.swap(std::ptr::null_mut(), Ordering::SeqCst);

	if !target.is_null() {
		worker.main_full.set(true);

		/* Safety: the interrupted context is the dispatch loop itself;
		 * capturing it into main_file is exactly the scheduler save.
		 * The target fiber is live and owned by this worker. */
		unsafe {
			arch::capture_mcontext(context, &mut *worker.main_file.get());
			arch::install_mcontext(context, &*(*target).context().file());
		}

		return;
	}

	if worker.state() != WorkerState::Running {
		/* raced with the scheduler; nothing is on the cpu */
		return;
	}

	let fiber = worker.scheduler.current();

	if fiber.is_null() {
		return;
	}

	/* Safety: the Running fiber is live and owned by this worker; its
	 * context is not aliased while it is on the cpu */
	unsafe {
		arch::capture_mcontext(context, &mut *(*fiber).context_mut().file_mut());

		(*fiber).set_preempted();
		(*fiber).set_state(FiberState::Runnable);

		/* single-presence: Running kept it out of every queue; it goes
		 * back in at the tail so the rest of the queue moves up */
		worker.scheduler.queue.lock().append(fiber);
	}

	worker.set_state(WorkerState::Scheduling);

	/* Safety: main_file holds the scheduler's last switch-out */
	unsafe {
		arch::install_mcontext(context, &*worker.main_file.get());

		block_in_context(context, signum);
	}
}

/// Add `signum` to the mask a signal delivery will reinstate on return,
/// so the rewritten context resumes with the signal blocked.
///
/// # Safety
/// `context` must be the ucontext passed to a running signal handler.
unsafe fn block_in_context(context: *mut libc::c_void, signum: i32) {
	let uc = context.cast::<libc::ucontext_t>();

	/* Safety: guaranteed by caller */
	unsafe { libc::sigaddset(std::ptr::addr_of_mut!((*uc).uc_sigmask), signum) };
}

/// Scoped preemption blocking.
///
/// A fiber doing non-reentrant work — the heap, stdio, anything the
/// preemption signal must not interrupt — holds one of these. The
/// runtime brackets its own allocations the same way. Restores the
/// previous mask on drop, so guards nest.
pub struct PreemptGuard {
	saved: libc::sigset_t
}

impl PreemptGuard {
	/// Block `signal` until the guard drops.
	pub fn new(signal: Signal) -> OsResult<Self> {
		Ok(Self { saved: signal::block(signal)? })
	}
}

impl Default for PreemptGuard {
	#[allow(clippy::expect_used)]
	fn default() -> Self {
		Self::new(Signal::Urgent).expect("failed to mask the preemption signal")
	}
}

impl Drop for PreemptGuard {
	fn drop(&mut self) {
		let _ = signal::restore_mask(&self.saved);
	}
}
