use super::error::{result_from_libc, OsResult};

/// Nanoseconds on the monotonic clock.
///
/// All slice accounting runs on this clock; wall time is never consulted.
#[allow(clippy::arithmetic_side_effects, clippy::cast_sign_loss)]
pub fn now_ns() -> OsResult<u64> {
	let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };

	/* Safety: ts is a valid timespec */
	result_from_libc(unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } as isize)?;

	Ok((ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64)
}
