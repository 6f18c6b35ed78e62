//! Preemption behavior: slice-bounded interleaving, fairness across
//! compute-bound fibers, and register integrity across forced suspends.
//!
//! Everything here is wall-clock sensitive, so the tests serialize on one
//! lock instead of competing for cores with each other.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use weft::{Config, PreemptGuard, Runtime};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
	SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn single_worker(slice_budget_ns: u64) -> Runtime {
	Runtime::new(Config { slice_budget_ns, ..Config::default() }).unwrap()
}

/// A descheduling shows up as a gap in an otherwise tight loop.
fn count_resumptions(
	runtime: &Runtime, tag: &'static str, resumptions: &Arc<AtomicUsize>, stop: &Arc<AtomicBool>
) {
	let resumptions = resumptions.clone();
	let stop = stop.clone();

	runtime
		.spawn(tag, move || {
			let mut last = Instant::now();

			while !stop.load(Ordering::Relaxed) {
				let now = Instant::now();

				if now.duration_since(last) > Duration::from_millis(5) {
					resumptions.fetch_add(1, Ordering::Relaxed);
				}

				last = now;
			}
		})
		.unwrap();
}

#[test]
fn test_two_spinners_share_one_worker() {
	let _serial = serial();

	let runtime = single_worker(20_000_000);
	let stop = Arc::new(AtomicBool::new(false));
	let first = Arc::new(AtomicUsize::new(0));
	let second = Arc::new(AtomicUsize::new(0));

	count_resumptions(&runtime, "spin-a", &first, &stop);
	count_resumptions(&runtime, "spin-b", &second, &stop);

	thread::sleep(Duration::from_secs(2));
	stop.store(true, Ordering::Relaxed);
	thread::sleep(Duration::from_millis(100));

	/* with a 20 ms slice over 2 s, two fibers alternating on one worker
	 * are each forced off the cpu roughly 50 times; generous slack for
	 * host scheduling noise, but the order of magnitude must hold and
	 * neither fiber may starve */
	let first = first.load(Ordering::Relaxed);
	let second = second.load(Ordering::Relaxed);

	assert!(first >= 20 && first <= 200, "fiber A resumed {} times", first);
	assert!(second >= 20 && second <= 200, "fiber B resumed {} times", second);
}

#[test]
fn test_preemption_preserves_registers_and_memory() {
	let _serial = serial();

	/* the shortest legal slice maximizes forced suspends */
	let runtime = single_worker(1_000_000);
	let stop = Arc::new(AtomicBool::new(false));
	let torn = Arc::new(AtomicBool::new(false));
	let rounds = Arc::new(AtomicU64::new(0));
	let fib = Arc::new(AtomicU64::new(0));

	/* preemption only fires while another fiber is waiting its turn, so
	 * the pattern fiber shares the worker with a spinner */
	{
		let stop = stop.clone();

		runtime
			.spawn("companion", move || {
				while !stop.load(Ordering::Relaxed) {
					burn(10_000);
				}
			})
			.unwrap();
	}

	{
		let stop = stop.clone();
		let torn = torn.clone();
		let rounds = rounds.clone();
		let fib = fib.clone();

		runtime
			.spawn("pattern", move || {
				let mut arr = [0usize; 256];

				while !stop.load(Ordering::Relaxed) {
					for (index, slot) in arr.iter_mut().enumerate() {
						*slot = index;
					}

					/* a long dependent chain keeps many values live in
					 * registers across any preemption point */
					let mut prev: u64 = 0;
					let mut current: u64 = 1;

					for _ in 0..90 {
						let next = prev.wrapping_add(current);

						prev = current;
						current = next;
					}

					fib.store(current, Ordering::Relaxed);

					if arr.iter().enumerate().any(|(index, &slot)| slot != index) {
						torn.store(true, Ordering::Relaxed);
					}

					rounds.fetch_add(1, Ordering::Relaxed);
				}
			})
			.unwrap();
	}

	thread::sleep(Duration::from_secs(3));
	stop.store(true, Ordering::Relaxed);
	thread::sleep(Duration::from_millis(100));

	/* the same chain computed without preemption */
	let mut prev: u64 = 0;
	let mut current: u64 = 1;

	for _ in 0..90 {
		let next = prev.wrapping_add(current);

		prev = current;
		current = next;
	}

	assert!(!torn.load(Ordering::Relaxed), "array writes were torn");
	assert_eq!(fib.load(Ordering::Relaxed), current, "register chain corrupted");
	assert!(rounds.load(Ordering::Relaxed) > 100, "fiber made no progress");
}

fn burn(iters: u64) {
	for _ in 0..iters {
		std::hint::black_box(0u64);
	}
}

#[test]
fn test_eight_workloads_all_progress() {
	let _serial = serial();

	let runtime = single_worker(20_000_000);
	let stop = Arc::new(AtomicBool::new(false));
	let published: Vec<_> = (0..8).map(|_| Arc::new(AtomicU64::new(0))).collect();

	/* five busy spinners */
	for (index, cell) in published.iter().enumerate().take(5) {
		let cell = cell.clone();
		let stop = stop.clone();
		let tags = ["spin-0", "spin-1", "spin-2", "spin-3", "spin-4"];

		runtime
			.spawn(tags[index], move || {
				while !stop.load(Ordering::Relaxed) {
					burn(500_000);
					cell.fetch_add(1, Ordering::Relaxed);
				}
			})
			.unwrap();
	}

	/* an endless fibonacci chain */
	{
		let cell = published[5].clone();
		let stop = stop.clone();

		runtime
			.spawn("fib", move || {
				let mut prev = 0u64;
				let mut current = 1u64;

				while !stop.load(Ordering::Relaxed) {
					let next = prev.wrapping_add(current);

					prev = current;
					current = next;

					cell.store(current.max(1), Ordering::Relaxed);
					burn(100_000);
				}
			})
			.unwrap();
	}

	/* an endless factorial chain */
	{
		let cell = published[6].clone();
		let stop = stop.clone();

		runtime
			.spawn("factorial", move || {
				let mut factorial = 1u64;
				let mut step = 1u64;

				while !stop.load(Ordering::Relaxed) {
					factorial = factorial.wrapping_mul(step).max(1);
					step = step.wrapping_add(1);

					cell.store(factorial, Ordering::Relaxed);
					burn(100_000);
				}
			})
			.unwrap();
	}

	/* an iterative ackermann, with its scratch allocated under the
	 * preemption guard as heap use on a fiber requires */
	{
		let cell = published[7].clone();
		let stop = stop.clone();

		runtime
			.spawn("ackermann", move || {
				let mut scratch = {
					let _guard = PreemptGuard::default();

					Vec::with_capacity(1 << 16)
				};

				let mut input = 0u64;

				while !stop.load(Ordering::Relaxed) {
					cell.store(ackermann(input % 3, &mut scratch).max(1), Ordering::Relaxed);

					input = input.wrapping_add(1);
				}

				/* heap release is bracketed like the acquisition */
				let _guard = PreemptGuard::default();

				drop(scratch);
			})
			.unwrap();
	}

	thread::sleep(Duration::from_secs(3));

	/* every fiber published at least once; none is stuck */
	for (index, cell) in published.iter().enumerate() {
		assert!(cell.load(Ordering::Relaxed) > 0, "workload {} made no progress", index);
	}

	stop.store(true, Ordering::Relaxed);
	thread::sleep(Duration::from_millis(100));
}

/// Ackermann(n, n) without recursion, on an explicit stack.
fn ackermann(n: u64, stack: &mut Vec<u64>) -> u64 {
	stack.clear();

	let mut m = n;
	let mut k = n;

	loop {
		if m == 0 {
			k += 1;

			match stack.pop() {
				Some(top) => m = top,
				None => return k
			}
		} else if k == 0 {
			m -= 1;
			k = 1;
		} else {
			stack.push(m - 1);
			k -= 1;
		}
	}
}

#[test]
fn test_fairness_under_four_spinners() {
	let _serial = serial();

	let runtime = single_worker(20_000_000);
	let stop = Arc::new(AtomicBool::new(false));
	let progress: Vec<_> = (0..4).map(|_| Arc::new(AtomicU64::new(0))).collect();

	for (index, cell) in progress.iter().enumerate() {
		let cell = cell.clone();
		let stop = stop.clone();
		let tags = ["fair-0", "fair-1", "fair-2", "fair-3"];

		runtime
			.spawn(tags[index], move || {
				while !stop.load(Ordering::Relaxed) {
					burn(100_000);
					cell.fetch_add(1, Ordering::Relaxed);
				}
			})
			.unwrap();
	}

	thread::sleep(Duration::from_secs(2));
	stop.store(true, Ordering::Relaxed);
	thread::sleep(Duration::from_millis(100));

	/* FIFO with rotation: over ~100 slices every fiber gets the cpu */
	for (index, cell) in progress.iter().enumerate() {
		assert!(cell.load(Ordering::Relaxed) > 0, "fiber {} starved", index);
	}
}
