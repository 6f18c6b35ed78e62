use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::context::Context;
use crate::macros::{call_no_unwind, fatal};
use crate::os::error::OsResult;
use crate::worker::Worker;

/// Raw fiber entry: one opaque byte pointer in, one out. Entries taking
/// several scalar arguments are admitted through the same type; the
/// argument registers are loaded from the context, not the signature.
pub type RawEntry = unsafe extern "C" fn(*mut u8) -> *mut u8;

/// Scheduling states. `Created` exists only between construction and
/// admission; `Done` is terminal and hands the fiber to the monitor for
/// release. `Syscall` and `Waiting` are carried for the scheduler's
/// rotation policy but nothing in the core enters them.
#[derive(PartialEq, Eq, Clone, Copy, Debug, FromPrimitive)]
#[repr(u8)]
pub enum FiberState {
	Created,
	Runnable,
	Running,
	Syscall,
	Waiting,
	Done
}

/// Intrusive queue linkage. Only ever touched under the owning queue's
/// lock, through the raw fiber pointer.
pub(crate) struct Link {
	pub prev: *mut Fiber,
	pub next: *mut Fiber
}

/// A user-scheduled unit of execution: one context (register file +
/// private stack), an entry function, and the atomic scheduling state
/// shared between worker, monitor and preemption handler.
pub struct Fiber {
	context: Context,
	state: AtomicU8,
	location: &'static str,

	/// Set by the preemption handler on first capture. A preempted
	/// register file holds live scratch registers and must be resumed
	/// through the machine-context path, never the cooperative one.
	preempted: AtomicBool,

	/// The worker currently running this fiber. Non-owning; set at
	/// dispatch, cleared when the fiber leaves the worker.
	worker: AtomicPtr<Worker>,

	pub(crate) link: Link
}

/* Safety: fibers travel between the spawner, monitor and workers; every
 * mutable access is serialized by queue locks or the Running ownership */
unsafe impl Send for Fiber {}

/* Safety: shared fields are atomics */
unsafe impl Sync for Fiber {}

impl Fiber {
	/// Allocate a fiber whose context starts `entry` with the described
	/// scalar arguments in registers.
	pub(crate) fn new(
		location: &'static str, entry: RawEntry, sizes: &[usize], bytes: &[u8],
		stack_size: usize
	) -> OsResult<Box<Self>> {
		let mut context = Context::with_entry(entry as usize, stack_size)?;

		context.place_args(sizes, bytes);

		Ok(Box::new(Self {
			context,
			state: AtomicU8::new(FiberState::Created as u8),
			location,
			preempted: AtomicBool::new(false),
			worker: AtomicPtr::new(std::ptr::null_mut()),
			link: Link { prev: std::ptr::null_mut(), next: std::ptr::null_mut() }
		}))
	}

	pub fn state(&self) -> FiberState {
		let raw = self.state.load(Ordering::SeqCst);

		FiberState::from_u8(raw).unwrap_or_else(|| fatal!("corrupt fiber state {}", raw))
	}

	pub(crate) fn set_state(&self, state: FiberState) {
		self.state.store(state as u8, Ordering::SeqCst);
	}

	pub fn location(&self) -> &'static str {
		self.location
	}

	pub(crate) fn preempted(&self) -> bool {
		self.preempted.load(Ordering::SeqCst)
	}

	pub(crate) fn set_preempted(&self) {
		self.preempted.store(true, Ordering::SeqCst);
	}

	pub(crate) fn set_worker(&self, worker: *mut Worker) {
		self.worker.store(worker, Ordering::SeqCst);
	}

	pub(crate) fn context(&self) -> &Context {
		&self.context
	}

	pub(crate) fn context_mut(&mut self) -> &mut Context {
		&mut self.context
	}
}

impl Debug for Fiber {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
		fmt.debug_struct("Fiber")
			.field("location", &self.location)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

/// Opaque handle returned by spawn. The runtime owns the fiber; the
/// handle is a token for logs and identity, never a dereference.
#[derive(Clone, Copy)]
pub struct FiberHandle {
	id: usize,
	location: &'static str
}

impl FiberHandle {
	pub(crate) fn new(fiber: &Fiber) -> Self {
		Self {
			id: std::ptr::from_ref(fiber) as usize,
			location: fiber.location
		}
	}

	pub fn location(&self) -> &'static str {
		self.location
	}
}

impl Debug for FiberHandle {
	fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
		write!(fmt, "FiberHandle({:#x}, {:?})", self.id, self.location)
	}
}

/// Type-erased trampoline for closure entries: the box travels through
/// the fiber's single pointer argument and is consumed on first (and
/// only) call. A panic here would unwind into the entry shim's frame,
/// so it aborts instead.
///
/// The closure is moved onto the fiber stack and its heap block freed
/// with the preemption signal blocked — the allocator is not re-entrant
/// with respect to it.
pub(crate) unsafe extern "C" fn closure_entry<F>(arg: *mut u8) -> *mut u8
where
	F: FnOnce() + Send + 'static
{
	let raw = arg.cast::<std::mem::ManuallyDrop<F>>();

	let func = {
		let _guard = crate::worker::entry_guard();

		/* Safety: spawn leaked exactly this box into the argument; the
		 * take moves the closure out, the box free leaves it intact */
		unsafe {
			let func = std::mem::ManuallyDrop::take(&mut *raw);

			drop(Box::from_raw(raw));

			func
		}
	};

	call_no_unwind(func);

	std::ptr::null_mut()
}
