use crate::os::signal::Signal;

pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;
pub const DEFAULT_ALT_STACK_SIZE: usize = 32 * 1024;
pub const DEFAULT_SLICE_BUDGET_NS: u64 = 20_000_000;
pub const DEFAULT_MONITOR_INTERVAL_US: u64 = 500;

pub const MIN_SLICE_BUDGET_NS: u64 = 1_000_000;
pub const MAX_SLICE_BUDGET_NS: u64 = 100_000_000;

/// Runtime tunables. `Default` matches the compile-time constants of the
/// reference configuration: one worker, 16 KiB fiber stacks, a 20 ms time
/// slice, and a 500 µs monitor sweep.
#[derive(Clone, Copy, Debug)]
pub struct Config {
	/// Number of worker threads.
	pub workers: usize,

	/// Reserved for future processor pinning. Carried, not consulted.
	pub processors: usize,

	/// Bytes of private stack per fiber. Not bounds-checked at runtime.
	pub stack_size: usize,

	/// Bytes of alternate stack per worker for the preemption handler.
	pub alt_stack_size: usize,

	/// Nanoseconds a fiber may run before the monitor preempts it.
	pub slice_budget_ns: u64,

	/// Microseconds between monitor sweeps.
	pub monitor_interval_us: u64,

	/// Signal used for preemption. `Urgent` is rarely generated by the
	/// kernel, which keeps stray deliveries out of the scheduler.
	pub preempt_signal: Signal
}

impl Default for Config {
	fn default() -> Self {
		Self {
			workers: 1,
			processors: 1,
			stack_size: DEFAULT_STACK_SIZE,
			alt_stack_size: DEFAULT_ALT_STACK_SIZE,
			slice_budget_ns: DEFAULT_SLICE_BUDGET_NS,
			monitor_interval_us: DEFAULT_MONITOR_INTERVAL_US,
			preempt_signal: Signal::Urgent
		}
	}
}

impl Config {
	/// Clamp the tunables into their supported ranges.
	///
	/// The slice budget is held between 1 ms and 100 ms; shorter slices
	/// drown the workers in signals, longer ones defeat preemption.
	#[must_use]
	pub fn validated(mut self) -> Self {
		self.workers = self.workers.max(1);
		self.stack_size = self.stack_size.max(4096);
		self.alt_stack_size = self.alt_stack_size.max(DEFAULT_ALT_STACK_SIZE);
		self.slice_budget_ns = self
			.slice_budget_ns
			.clamp(MIN_SLICE_BUDGET_NS, MAX_SLICE_BUDGET_NS);
		self.monitor_interval_us = self.monitor_interval_us.max(50);
		self
	}
}
