//! A preemptive M:N fiber runtime.
//!
//! Many lightweight fibers, each with a private stack and saved register
//! file, are multiplexed onto a fixed pool of worker threads. A monitor
//! thread distributes admitted fibers round-robin over the workers and
//! delivers a preemption signal to any worker whose current fiber has
//! exceeded its time slice; the signal handler captures the interrupted
//! register file and re-enters the worker's scheduler, which resumes the
//! fiber later exactly where it was cut off.
//!
//! ```no_run
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let runtime = weft::Runtime::new(weft::Config::default()).unwrap();
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = hits.clone();
//!
//! runtime.spawn("counter", move || {
//!     h.fetch_add(1, Ordering::SeqCst);
//! }).unwrap();
//! ```

pub mod arch;
pub mod config;
pub mod context;
pub mod fiber;
mod macros;
pub mod os;
pub mod preempt;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod sync;
pub mod worker;

pub use config::Config;
pub use fiber::FiberHandle;
pub use preempt::PreemptGuard;
pub use runtime::{init, shutdown, spawn, spawn_raw, Runtime};
