use std::sync::{Condvar, Mutex};

/// Counting semaphore for worker idling.
///
/// Posts are counted, so a wakeup issued while the worker is still
/// scheduling is consumed by its next wait instead of being lost.
pub struct Semaphore {
	permits: Mutex<usize>,
	notify: Condvar
}

impl Semaphore {
	#[must_use]
	pub const fn new() -> Self {
		Self { permits: Mutex::new(0), notify: Condvar::new() }
	}

	#[allow(clippy::unwrap_used)]
	pub fn post(&self) {
		let mut permits = self.permits.lock().unwrap();

		*permits = permits.saturating_add(1);

		self.notify.notify_one();
	}

	#[allow(clippy::unwrap_used)]
	pub fn wait(&self) {
		let mut permits = self.permits.lock().unwrap();

		while *permits == 0 {
			permits = self.notify.wait(permits).unwrap();
		}

		*permits -= 1;
	}
}

impl Default for Semaphore {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use std::thread;

	use super::*;

	#[test]
	fn test_post_before_wait() {
		let sem = Semaphore::new();

		sem.post();
		sem.post();
		sem.wait();
		sem.wait();
	}

	#[test]
	fn test_wakes_blocked_waiter() {
		let sem = Arc::new(Semaphore::new());
		let waiter = {
			let sem = sem.clone();

			thread::spawn(move || sem.wait())
		};

		sem.post();
		waiter.join().unwrap();
	}
}
