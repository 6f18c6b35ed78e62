use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::arch;
use crate::arch::RegisterFile;
use crate::fiber::{Fiber, FiberState};
use crate::macros::{fatal, invariant};
use crate::os::mman::Map;
use crate::os::{signal, time};
use crate::preempt;
use crate::runtime::Shared;
use crate::scheduler::LocalScheduler;
use crate::sync::Semaphore;

/// Worker lifecycle. `Idle` is blocked on the semaphore, `Scheduling` is
/// the scheduler loop (including the preemption handler), `Running` is
/// user code inside a fiber.
#[derive(PartialEq, Eq, Clone, Copy, Debug, FromPrimitive)]
#[repr(u8)]
pub enum WorkerState {
	Created,
	Idle,
	Running,
	Scheduling,
	Dead
}

thread_local! {
	/// Installed once at worker startup so the preemption handler can
	/// find its worker; null on every other thread.
	pub(crate) static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(std::ptr::null()) };
}

/// One OS thread of the pool.
pub struct Worker {
	index: usize,
	shared: Arc<Shared>,
	pub(crate) scheduler: LocalScheduler,
	idle: Semaphore,
	state: AtomicU8,

	/// Monotonic nanoseconds at which the current slice began. Written
	/// at dispatch, read by the monitor's over-budget check.
	slice_start: AtomicU64,

	/// pthread handle for directed preemption signals.
	thread: AtomicU64,

	/// Armed by dispatch when the next fiber carries a preempted (full)
	/// register file; consumed by the handler of the self-directed
	/// signal that performs the resume.
	pub(crate) resume_target: AtomicPtr<Fiber>,

	/// Armed by the epilogue when the scheduler context itself must be
	/// re-entered through the kernel; consumed by the handler.
	pub(crate) exit_to_main: AtomicBool,

	/// Save area for the scheduler loop's own context. Written by the
	/// context switch out of the scheduler, or by the handler capturing
	/// the interrupted scheduler during a signalled resume; only ever
	/// touched from the owning thread.
	pub(crate) main_file: UnsafeCell<RegisterFile>,

	/// Whether `main_file` is a full handler capture rather than a
	/// cooperative switch-out. A full capture holds live scratch
	/// registers and may only be reinstalled by the kernel.
	pub(crate) main_full: Cell<bool>
}

/* Safety: main_file is only accessed by the owning thread and its own
 * signal handler; everything else is atomic or internally locked */
unsafe impl Send for Worker {}

/* Safety: as above */
unsafe impl Sync for Worker {}

impl Worker {
	pub(crate) fn new(index: usize, shared: Arc<Shared>) -> Self {
		Self {
			index,
			shared,
			scheduler: LocalScheduler::new(),
			idle: Semaphore::new(),
			state: AtomicU8::new(WorkerState::Created as u8),
			slice_start: AtomicU64::new(0),
			thread: AtomicU64::new(0),
			resume_target: AtomicPtr::new(std::ptr::null_mut()),
			exit_to_main: AtomicBool::new(false),
			main_file: UnsafeCell::new(RegisterFile::default()),
			main_full: Cell::new(false)
		}
	}

	pub fn index(&self) -> usize {
		self.index
	}

	pub fn state(&self) -> WorkerState {
		let raw = self.state.load(Ordering::SeqCst);

		WorkerState::from_u8(raw).unwrap_or_else(|| fatal!("corrupt worker state {}", raw))
	}

	pub(crate) fn set_state(&self, state: WorkerState) {
		self.state.store(state as u8, Ordering::SeqCst);
	}

	pub(crate) fn preempt_signal(&self) -> signal::Signal {
		self.shared.config.preempt_signal
	}

	pub(crate) fn slice_start(&self) -> u64 {
		self.slice_start.load(Ordering::SeqCst)
	}

	pub(crate) fn thread_handle(&self) -> libc::pthread_t {
		self.thread.load(Ordering::SeqCst)
	}

	pub(crate) fn set_thread_handle(&self, thread: libc::pthread_t) {
		self.thread.store(thread, Ordering::SeqCst);
	}

	pub(crate) fn wake(&self) {
		self.idle.post();
	}

	/// Thread body. Never returns until shutdown.
	pub(crate) fn run(&self) {
		CURRENT_WORKER.with(|current| current.set(std::ptr::from_ref(self)));

		let preempt_signal = self.shared.config.preempt_signal;

		/* the handler must never fire before the alternate stack and the
		 * self pointer are in place */
		if let Err(err) = signal::block(preempt_signal) {
			fatal!("== worker {}: failed to block {:?}: {}", self.index, preempt_signal, err);
		}

		let _alt_stack = match self.install_signal_stack() {
			Ok(map) => map,
			Err(err) => {
				fatal!("== worker {}: failed to install signal stack: {}", self.index, err)
			}
		};

		if let Err(err) = preempt::install(preempt_signal) {
			fatal!("== worker {}: failed to install handler: {}", self.index, err);
		}

		debug!("++ worker {} up", self.index);

		self.set_state(WorkerState::Idle);

		loop {
			self.idle.wait();

			if self.shared.closed() {
				break;
			}

			self.set_state(WorkerState::Scheduling);
			self.schedule();
		}

		self.set_state(WorkerState::Dead);

		debug!("-- worker {} down", self.index);
	}

	fn install_signal_stack(&self) -> std::io::Result<Map> {
		let map = Map::stack(self.shared.config.alt_stack_size)?;

		signal::install_alt_stack(map.addr(), map.length())?;

		Ok(map)
	}

	/// One scheduling session: run fibers until the local queue has
	/// nothing runnable, then go idle. The preemption signal is blocked
	/// on every path through here; it is only open while a fiber runs.
	fn schedule(&self) {
		loop {
			if self.shared.closed() {
				return;
			}

			self.requeue_current();

			let mut retired = Vec::new();
			let next = self.scheduler.pick_runnable(&mut retired);

			self.retire(retired);

			if next.is_null() {
				self.set_state(WorkerState::Idle);

				return;
			}

			self.dispatch(next);

			/* the fiber was preempted or completed; go around */
			self.set_state(WorkerState::Scheduling);
		}
	}

	/// Put the previously running fiber where its state says it belongs.
	fn requeue_current(&self) {
		let fiber = self.scheduler.current();

		if fiber.is_null() {
			return;
		}

		self.scheduler.set_current(std::ptr::null_mut());

		/* Safety: a fiber in `current` is live and owned by this worker */
		let state = unsafe { (*fiber).state() };

		match state {
			/* preempted: the handler already marked it Runnable and
			 * appended it to the back of the local queue */
			FiberState::Runnable => {},

			/* clean return while still Running: voluntary round-robin */
			FiberState::Running => {
				/* Safety: fiber is live and in no queue while Running */
				unsafe {
					(*fiber).set_state(FiberState::Runnable);
					self.scheduler.queue.lock().append(fiber);
				}
			},

			/* finished: hand back for the monitor to free */
			FiberState::Done => {
				/* Safety: fiber is live and in no queue */
				unsafe {
					(*fiber).set_worker(std::ptr::null_mut());
					self.shared.global.lock().append(fiber);
				}
			},

			state => fatal!(
				"fiber {:p} left the cpu of worker {} in state {:?}",
				fiber,
				self.index,
				state
			)
		}
	}

	/// Hand `Done` fibers swept out of the local queue to the monitor.
	fn retire(&self, retired: Vec<*mut Fiber>) {
		for fiber in retired {
			/* Safety: popped from the local queue, in no other queue */
			unsafe {
				(*fiber).set_worker(std::ptr::null_mut());
				self.shared.global.lock().append(fiber);
			}
		}
	}

	/// Enter `fiber`. Returns when control comes back to the scheduler —
	/// through the preemption handler or the fiber's epilogue.
	fn dispatch(&self, fiber: *mut Fiber) {
		let preempt_signal = self.shared.config.preempt_signal;
		let now = time::now_ns().unwrap_or_else(|err| fatal!("== monotonic clock: {}", err));

		self.slice_start.store(now, Ordering::SeqCst);

		/* Safety: picked fibers are live; this worker owns them now */
		let preempted = unsafe {
			(*fiber).set_worker(std::ptr::from_ref(self).cast_mut());
			(*fiber).set_state(FiberState::Running);
			(*fiber).preempted()
		};

		self.set_state(WorkerState::Running);

		/* a preemption signal queued while this thread was scheduling
		 * would fire the moment the mask opens, mid-switch; eat it */
		if let Err(err) = signal::consume_pending(preempt_signal) {
			fatal!("== worker {}: consume pending: {}", self.index, err);
		}

		if preempted {
			self.resume_target.store(fiber, Ordering::SeqCst);
		}

		if let Err(err) = signal::unblock(preempt_signal) {
			fatal!("== worker {}: unblock: {}", self.index, err);
		}

		if preempted {
			/* full register file: only the kernel can install it
			 * atomically. The handler of this self-directed signal saves
			 * the scheduler into main_file and rewrites the interrupted
			 * context to the fiber; control returns here when the worker
			 * context is next re-entered, signal blocked again. */
			if let Err(err) = signal::raise_self(preempt_signal) {
				fatal!("== worker {}: resume signal: {}", self.index, err);
			}
		} else {
			/* fresh context: cooperative entry */
			self.main_full.set(false);

			let to = unsafe { (*fiber).context().file() };

			/* Safety: main_file belongs to this thread; the fiber
			 * context is fresh and its stack is live */
			unsafe { arch::switch(self.main_file.get(), to) };
		}
	}
}

/// The preemption mask to hold over an allocator call made on a fiber.
/// Resolves the configured signal through the worker the caller runs on.
pub(crate) fn entry_guard() -> crate::preempt::PreemptGuard {
	let worker = CURRENT_WORKER.with(Cell::get);

	let preempt_signal = if worker.is_null() {
		signal::Signal::Urgent
	} else {
		/* Safety: worker threads outlive their fibers */
		unsafe { (*worker).preempt_signal() }
	};

	crate::preempt::PreemptGuard::new(preempt_signal)
		.unwrap_or_else(|err| fatal!("== failed to mask the preemption signal: {}", err))
}

/// Fiber epilogue, called by the arch entry shim when an entry function
/// returns. The returned pointer stays in its register per the calling
/// convention and is not plumbed further.
#[no_mangle]
extern "C" fn weft_fiber_exit(_result: *mut u8) -> ! {
	let worker = CURRENT_WORKER.with(Cell::get);

	invariant!(!worker.is_null(), "fiber epilogue outside a worker thread");

	/* Safety: worker threads outlive their fibers */
	let worker = unsafe { &*worker };

	/* the scheduler must not be preempted */
	if let Err(err) = signal::block(worker.shared.config.preempt_signal) {
		fatal!("== worker {}: epilogue block: {}", worker.index, err);
	}

	let fiber = worker.scheduler.current();

	invariant!(!fiber.is_null(), "fiber epilogue with no current fiber");

	/* Safety: the finished fiber stays live until the monitor frees it */
	unsafe { (*fiber).set_state(FiberState::Done) };

	worker.set_state(WorkerState::Scheduling);

	if !worker.main_full.get() {
		/* Safety: main_file holds the scheduler's cooperative
		 * switch-out; its thread stack frame is still live under this
		 * fiber, and the switch return site has no live scratch */
		unsafe { arch::restore(worker.main_file.get()) }
	}

	/* main_file is a full handler capture: its scratch registers are
	 * live, so only the kernel may reinstall it. Route through the
	 * handler of a self-directed signal. */
	let preempt_signal = worker.shared.config.preempt_signal;

	if let Err(err) = signal::consume_pending(preempt_signal) {
		fatal!("== worker {}: epilogue consume: {}", worker.index, err);
	}

	worker.exit_to_main.store(true, Ordering::SeqCst);

	if let Err(err) = signal::unblock(preempt_signal) {
		fatal!("== worker {}: epilogue unblock: {}", worker.index, err);
	}

	let _ = signal::raise_self(preempt_signal);

	/* the handler rewrote the delivery to resume the scheduler; this
	 * point is unreachable unless that failed */
	fatal!("== worker {}: epilogue signal was not delivered", worker.index)
}
