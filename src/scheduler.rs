use std::sync::atomic::{AtomicPtr, Ordering};

use crate::fiber::{Fiber, FiberState};
use crate::queue::FiberQueue;
use crate::sync::SpinMutex;

/// Per-worker scheduling state: the fiber currently on the CPU (null
/// when idle or between fibers) and the local run queue.
pub struct LocalScheduler {
	current: AtomicPtr<Fiber>,
	pub(crate) queue: SpinMutex<FiberQueue>
}

impl LocalScheduler {
	#[must_use]
	pub fn new() -> Self {
		Self {
			current: AtomicPtr::new(std::ptr::null_mut()),
			queue: SpinMutex::new(FiberQueue::new())
		}
	}

	pub(crate) fn current(&self) -> *mut Fiber {
		self.current.load(Ordering::SeqCst)
	}

	pub(crate) fn set_current(&self, fiber: *mut Fiber) {
		self.current.store(fiber, Ordering::SeqCst);
	}

	pub fn queue_len(&self) -> usize {
		self.queue.lock().len()
	}

	/// Select the next fiber to run.
	///
	/// Scans from the head, inspecting at most as many entries as the
	/// queue held on entry. A `Runnable` head is popped and becomes
	/// `current`; a `Done` head is popped into `retired` for the caller
	/// to hand back to the monitor; any other state rotates to the back
	/// and the scan continues. Null when nothing is runnable — the
	/// bounded scan means a queue of blocked fibers parks the worker
	/// rather than spinning it forever.
	pub(crate) fn pick_runnable(&self, retired: &mut Vec<*mut Fiber>) -> *mut Fiber {
		let mut queue = self.queue.lock();
		let passes = queue.len();

		for _ in 0..passes {
			let head = queue.front();

			if head.is_null() {
				break;
			}

			/* Safety: queued fibers are live until the monitor frees them */
			match unsafe { (*head).state() } {
				FiberState::Runnable => {
					let fiber = queue.pop_front();

					self.set_current(fiber);

					return fiber;
				},
				FiberState::Done => retired.push(queue.pop_front()),
				_ => queue.rotate()
			}
		}

		std::ptr::null_mut()
	}
}

impl Default for LocalScheduler {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::fiber::RawEntry;

	unsafe extern "C" fn nop(_: *mut u8) -> *mut u8 {
		std::ptr::null_mut()
	}

	fn fiber(state: FiberState) -> Box<Fiber> {
		let fiber = Fiber::new("picked", nop as RawEntry, &[], &[], 16 * 1024).unwrap();

		fiber.set_state(state);
		fiber
	}

	#[test]
	fn test_picks_first_runnable() {
		let scheduler = LocalScheduler::new();
		let mut waiting = fiber(FiberState::Waiting);
		let mut runnable = fiber(FiberState::Runnable);

		{
			let mut queue = scheduler.queue.lock();

			/* Safety: each fiber enters exactly one queue */
			unsafe {
				queue.append(&mut *waiting);
				queue.append(&mut *runnable);
			}
		}

		let mut retired = Vec::new();
		let picked = scheduler.pick_runnable(&mut retired);

		assert_eq!(picked.cast_const(), std::ptr::from_ref(&*runnable));
		assert_eq!(scheduler.current(), picked);
		assert!(retired.is_empty());

		/* the blocked fiber stays queued for later passes */
		assert_eq!(scheduler.queue_len(), 1);
	}

	#[test]
	fn test_retires_done_and_parks_on_blocked() {
		let scheduler = LocalScheduler::new();
		let mut done = fiber(FiberState::Done);
		let mut syscall = fiber(FiberState::Syscall);

		{
			let mut queue = scheduler.queue.lock();

			/* Safety: each fiber enters exactly one queue */
			unsafe {
				queue.append(&mut *done);
				queue.append(&mut *syscall);
			}
		}

		let mut retired = Vec::new();
		let picked = scheduler.pick_runnable(&mut retired);

		assert!(picked.is_null());
		assert_eq!(retired, vec![std::ptr::from_mut(&mut *done)]);
		assert_eq!(scheduler.queue_len(), 1);
	}
}
