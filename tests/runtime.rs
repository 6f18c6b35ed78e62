use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use weft::{Config, Runtime};

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + timeout;

	while Instant::now() < deadline {
		if done() {
			return true;
		}

		thread::sleep(Duration::from_millis(1));
	}

	done()
}

#[test]
fn test_noop_fiber_runs_and_is_drained() {
	let runtime = Runtime::new(Config::default()).unwrap();
	let hits = Arc::new(AtomicUsize::new(0));

	{
		let hits = hits.clone();

		runtime
			.spawn("noop", move || {
				hits.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
	}

	/* the fiber must run, and every queue must drain once the monitor
	 * has swept the finished fiber away */
	assert!(wait_until(Duration::from_millis(100), || {
		hits.load(Ordering::SeqCst) == 1 && runtime.stats().total() == 0
	}));
}

#[test]
fn test_spawn_raw_places_pointer_argument() {
	static CELL: AtomicUsize = AtomicUsize::new(0);

	unsafe extern "C" fn entry(arg: *mut u8) -> *mut u8 {
		/* Safety: the spawner passed a live AtomicUsize */
		unsafe { &*arg.cast::<AtomicUsize>() }.store(7, Ordering::SeqCst);

		std::ptr::null_mut()
	}

	let runtime = Runtime::new(Config::default()).unwrap();
	let arg = (std::ptr::addr_of!(CELL) as u64).to_le_bytes();

	let handle = runtime.spawn_raw("raw", entry, &[8], &arg).unwrap();

	assert_eq!(handle.location(), "raw");
	assert!(wait_until(Duration::from_millis(100), || {
		CELL.load(Ordering::SeqCst) == 7
	}));
}

#[test]
fn test_contended_admission_queues_every_spawn() {
	/* a long monitor interval keeps the first sweep out of the way so
	 * the admission count is observable */
	let config = Config {
		monitor_interval_us: 500_000,
		..Config::default()
	};

	let runtime = Arc::new(Runtime::new(config).unwrap());
	let ran = Arc::new(AtomicUsize::new(0));
	let mut spawners = Vec::new();

	for _ in 0..10 {
		let runtime = runtime.clone();
		let ran = ran.clone();

		spawners.push(thread::spawn(move || {
			for _ in 0..10 {
				let ran = ran.clone();

				runtime
					.spawn("burst", move || {
						ran.fetch_add(1, Ordering::SeqCst);
					})
					.unwrap();
			}
		}));
	}

	for spawner in spawners {
		spawner.join().unwrap();
	}

	/* all hundred are admitted to the global queue before the sweep */
	assert_eq!(runtime.stats().global_depth, 100);

	/* and the sweep distributes and completes all of them */
	assert!(wait_until(Duration::from_secs(5), || {
		ran.load(Ordering::SeqCst) == 100 && runtime.stats().total() == 0
	}));
}

#[test]
fn test_round_robin_over_two_workers() {
	let config = Config { workers: 2, ..Config::default() };
	let runtime = Runtime::new(config).unwrap();
	let ran = Arc::new(AtomicUsize::new(0));

	for _ in 0..16 {
		let ran = ran.clone();

		runtime
			.spawn("fan-out", move || {
				ran.fetch_add(1, Ordering::SeqCst);
			})
			.unwrap();
	}

	assert!(wait_until(Duration::from_secs(2), || {
		ran.load(Ordering::SeqCst) == 16 && runtime.stats().total() == 0
	}));
}

#[test]
fn test_config_is_clamped() {
	let config = Config {
		workers: 0,
		slice_budget_ns: 1,
		monitor_interval_us: 0,
		..Config::default()
	}
	.validated();

	assert_eq!(config.workers, 1);
	assert_eq!(config.slice_budget_ns, weft::config::MIN_SLICE_BUDGET_NS);
	assert!(config.monitor_interval_us > 0);
}

#[test]
fn test_global_runtime_facade() {
	assert!(weft::spawn("early", || {}).is_err());

	weft::init(Config::default()).unwrap();

	/* double init is refused */
	assert!(weft::init(Config::default()).is_err());

	let hits = Arc::new(AtomicUsize::new(0));

	{
		let hits = hits.clone();

		weft::spawn("global", move || {
			hits.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();
	}

	assert!(wait_until(Duration::from_millis(500), || {
		hits.load(Ordering::SeqCst) == 1
	}));

	weft::shutdown();

	assert!(weft::spawn("late", || {}).is_err());
}
