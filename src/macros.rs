use std::fmt::Arguments;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Report an unrecoverable scheduler state and abort without unwinding.
///
/// Unwinding is never an option here: the callers are the monitor thread
/// and fiber entry glue, where a propagating panic would tear through
/// foreign frames or leave the scheduler holding a lock.
pub(crate) fn die(fmt: Arguments<'_>) -> ! {
	log::error!("!! {}", fmt);

	std::process::abort();
}

macro_rules! fatal {
	($($arg: tt)+) => {
		$crate::macros::die(format_args!($($arg)+))
	}
}

pub(crate) use fatal;

/// Abort on a violated scheduler invariant.
macro_rules! invariant {
	($cond: expr, $($arg: tt)+) => {
		if !$cond {
			$crate::macros::fatal!($($arg)+);
		}
	}
}

pub(crate) use invariant;

/// Run `func`, aborting the process if it panics.
pub(crate) fn call_no_unwind<F, T>(func: F) -> T
where
	F: FnOnce() -> T
{
	match catch_unwind(AssertUnwindSafe(func)) {
		Ok(value) => value,
		Err(_) => fatal!("Panic crossed a fiber boundary")
	}
}
