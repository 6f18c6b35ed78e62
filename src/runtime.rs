use std::io::{Error, ErrorKind};
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, error, trace, warn};

use crate::config::Config;
use crate::fiber::{closure_entry, Fiber, FiberHandle, FiberState, RawEntry};
use crate::macros::{fatal, invariant};
use crate::os::error::OsResult;
use crate::os::{signal, time};
use crate::preempt::PreemptGuard;
use crate::queue::FiberQueue;
use crate::sync::SpinMutex;
use crate::worker::{Worker, WorkerState};

/// State shared by spawners, workers and the monitor: the admission
/// queue and the shutdown flag.
pub(crate) struct Shared {
	pub(crate) config: Config,
	pub(crate) global: SpinMutex<FiberQueue>,
	closed: AtomicBool
}

impl Shared {
	pub(crate) fn closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}
}

/// Queue depths at one instant, for observation and tests.
#[derive(Clone, Debug, Default)]
pub struct RuntimeStats {
	pub global_depth: usize,
	pub local_depths: Vec<usize>
}

impl RuntimeStats {
	pub fn total(&self) -> usize {
		self.global_depth + self.local_depths.iter().sum::<usize>()
	}
}

/// The runtime: a worker pool, the global admission queue, and the
/// monitor thread that distributes work and enforces time slices.
///
/// Dropping the runtime is a hard tear-down: the monitor is joined,
/// idle workers exit, and in-flight fibers are abandoned.
pub struct Runtime {
	shared: Arc<Shared>,
	workers: Box<[Arc<Worker>]>,
	monitor: Option<JoinHandle<()>>
}

impl Runtime {
	pub fn new(config: Config) -> OsResult<Self> {
		let config = config.validated();
		let shared = Arc::new(Shared {
			config,
			global: SpinMutex::new(FiberQueue::new()),
			closed: AtomicBool::new(false)
		});

		let mut workers = Vec::with_capacity(config.workers);

		for index in 0..config.workers {
			let worker = Arc::new(Worker::new(index, shared.clone()));
			let result = thread::Builder::new()
				.name(format!("weft-wrk-{}", index))
				.spawn({
					let worker = worker.clone();

					move || worker.run()
				});

			match result {
				Ok(handle) => {
					worker.set_thread_handle(handle.as_pthread_t());
					workers.push(worker);
				},
				Err(err) => {
					error!("== failed to start worker {}: {}", index, err);

					shared.close();

					for worker in &workers {
						worker.wake();
					}

					return Err(err);
				}
			}
		}

		let monitor = {
			let shared = shared.clone();
			let workers: Vec<_> = workers.clone();

			thread::Builder::new()
				.name("weft-mon".into())
				.spawn(move || monitor_loop(&shared, &workers))
		};

		let monitor = match monitor {
			Ok(handle) => handle,
			Err(err) => {
				error!("== failed to start monitor: {}", err);

				shared.close();

				for worker in &workers {
					worker.wake();
				}

				return Err(err);
			}
		};

		debug!(
			"++ runtime up: {} workers, {} ms slice, {} us sweep",
			config.workers,
			config.slice_budget_ns / 1_000_000,
			config.monitor_interval_us
		);

		Ok(Self {
			shared,
			workers: workers.into_boxed_slice(),
			monitor: Some(monitor)
		})
	}

	pub fn config(&self) -> &Config {
		&self.shared.config
	}

	/// Admit a fiber running `entry` with the described scalar arguments.
	///
	/// `sizes` partitions `bytes` in declaration order; each scalar is
	/// zero-extended into the next argument register. The preemption
	/// signal is blocked for the whole construction — the allocator is
	/// not re-entrant with respect to it.
	pub fn spawn_raw(
		&self, location: &'static str, entry: RawEntry, sizes: &[usize], bytes: &[u8]
	) -> OsResult<FiberHandle> {
		if self.shared.closed() {
			return Err(Error::new(ErrorKind::BrokenPipe, "runtime is shut down"));
		}

		let _guard = PreemptGuard::new(self.shared.config.preempt_signal)?;

		let fiber = Fiber::new(location, entry, sizes, bytes, self.shared.config.stack_size)?;
		let handle = FiberHandle::new(&fiber);
		let raw = Box::into_raw(fiber);

		{
			let mut global = self.shared.global.lock();

			/* Safety: freshly allocated, in no queue */
			unsafe {
				global.append(raw);
				(*raw).set_state(FiberState::Runnable);
			}
		}

		trace!("## spawn {:?}", handle);

		Ok(handle)
	}

	/// Admit a closure as a fiber. The closure travels boxed through the
	/// fiber's pointer argument and runs exactly once.
	pub fn spawn<F>(&self, location: &'static str, func: F) -> OsResult<FiberHandle>
	where
		F: FnOnce() + Send + 'static
	{
		let _guard = PreemptGuard::new(self.shared.config.preempt_signal)?;

		let func = Box::into_raw(Box::new(std::mem::ManuallyDrop::new(func)));
		let arg = (func as usize as u64).to_le_bytes();

		match self.spawn_raw(location, closure_entry::<F>, &[8], &arg) {
			Ok(handle) => Ok(handle),
			Err(err) => {
				/* Safety: never admitted, reclaim the closure */
				unsafe {
					std::mem::ManuallyDrop::drop(&mut *func);
					drop(Box::from_raw(func));
				}

				Err(err)
			}
		}
	}

	pub fn stats(&self) -> RuntimeStats {
		RuntimeStats {
			global_depth: self.shared.global.lock().len(),
			local_depths: self
				.workers
				.iter()
				.map(|worker| worker.scheduler.queue_len())
				.collect()
		}
	}

	pub fn shutdown(&mut self) {
		self.shared.close();

		for worker in &self.workers {
			worker.wake();
		}

		if let Some(monitor) = self.monitor.take() {
			let _ = monitor.join();
		}

		debug!("-- runtime down");
	}
}

impl Drop for Runtime {
	fn drop(&mut self) {
		self.shutdown();
	}
}

/// The monitor: drains admissions into the workers, wakes idle workers
/// that have work, and issues preemption signals to workers whose fiber
/// has outrun its slice. Also the only place a `Done` fiber is freed.
fn monitor_loop(shared: &Shared, workers: &[Arc<Worker>]) {
	debug!("++ monitor up");

	let interval = Duration::from_micros(shared.config.monitor_interval_us);
	let mut round_robin = 0usize;

	while !shared.closed() {
		thread::sleep(interval);

		if shared.closed() {
			break;
		}

		drain_global(shared, workers, &mut round_robin);
		sweep_workers(shared, workers);
	}

	debug!("-- monitor down");
}

/// One bounded pass over the global queue, dispatching on the state of
/// each successive head.
fn drain_global(shared: &Shared, workers: &[Arc<Worker>], round_robin: &mut usize) {
	let passes = shared.global.lock().len();

	for _ in 0..passes {
		let mut global = shared.global.lock();
		let head = global.front();

		if head.is_null() {
			break;
		}

		/* Safety: queued fibers are live until freed below */
		let state = unsafe { (*head).state() };

		match state {
			FiberState::Runnable => {
				let fiber = global.pop_front();

				drop(global);

				let worker = &workers[*round_robin % workers.len()];

				*round_robin += 1;

				/* Safety: popped from the global queue, in no other */
				unsafe { worker.scheduler.queue.lock().append(fiber) };

				trace!("## fiber {:p} -> worker {}", fiber, worker.index());
			},
			FiberState::Done => {
				let fiber = global.pop_front();

				drop(global);

				trace!("## free fiber {:p}", fiber);

				/* Safety: the monitor is the sole freeer; a Done fiber
				 * in the global queue is referenced nowhere else */
				drop(unsafe { Box::from_raw(fiber) });
			},

			/* these should have left the global queue at dispatch; keep
			 * them circulating rather than reassigning */
			FiberState::Running | FiberState::Syscall | FiberState::Waiting => global.rotate(),

			FiberState::Created => {
				invariant!(false, "created fiber {:p} reached the global queue", head);
			}
		}
	}
}

/// Wake idle workers that have work and preempt the over-budget ones.
fn sweep_workers(shared: &Shared, workers: &[Arc<Worker>]) {
	let now = time::now_ns().unwrap_or_else(|err| fatal!("== monotonic clock: {}", err));

	for worker in workers {
		if worker.scheduler.queue_len() == 0 {
			continue;
		}

		match worker.state() {
			WorkerState::Created => {},
			WorkerState::Idle => worker.wake(),
			WorkerState::Running => {
				if now.saturating_sub(worker.slice_start()) > shared.config.slice_budget_ns {
					trace!("## preempting worker {}", worker.index());

					let result = signal::thread_kill(
						worker.thread_handle(),
						shared.config.preempt_signal
					);

					if let Err(err) = result {
						warn!("== failed to preempt worker {}: {}", worker.index(), err);
					}
				}
			},
			WorkerState::Scheduling | WorkerState::Dead => {}
		}
	}
}

lazy_static! {
	static ref GLOBAL: Mutex<Option<Runtime>> = Mutex::new(None);
}

#[allow(clippy::unwrap_used)]
fn global() -> std::sync::MutexGuard<'static, Option<Runtime>> {
	GLOBAL.lock().unwrap()
}

/// Construct the process-wide runtime. Calling it twice is refused.
pub fn init(config: Config) -> OsResult<()> {
	let mut slot = global();

	if slot.is_some() {
		return Err(Error::new(ErrorKind::AlreadyExists, "runtime already initialized"));
	}

	*slot = Some(Runtime::new(config)?);

	Ok(())
}

fn with_global<T>(func: impl FnOnce(&Runtime) -> OsResult<T>) -> OsResult<T> {
	match global().as_ref() {
		Some(runtime) => func(runtime),
		None => Err(Error::new(ErrorKind::NotConnected, "runtime is not initialized"))
	}
}

/// Admit a closure to the process-wide runtime.
pub fn spawn<F>(location: &'static str, func: F) -> OsResult<FiberHandle>
where
	F: FnOnce() + Send + 'static
{
	with_global(|runtime| runtime.spawn(location, func))
}

/// Admit a raw entry to the process-wide runtime.
pub fn spawn_raw(
	location: &'static str, entry: RawEntry, sizes: &[usize], bytes: &[u8]
) -> OsResult<FiberHandle> {
	with_global(|runtime| runtime.spawn_raw(location, entry, sizes, bytes))
}

/// Tear the process-wide runtime down unconditionally.
pub fn shutdown() {
	drop(global().take());
}
