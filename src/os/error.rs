use std::io::Error;

pub type OsResult<T> = std::io::Result<T>;

/// Convert a libc return value, reading `errno` on failure.
pub fn result_from_libc(result: isize) -> OsResult<isize> {
	if result >= 0 {
		return Ok(result);
	}

	Err(Error::last_os_error())
}

/// Convert a function that returns the error code directly
/// (the pthread family) instead of setting `errno`.
pub fn result_from_code(code: i32) -> OsResult<()> {
	if code == 0 {
		return Ok(());
	}

	Err(Error::from_raw_os_error(code))
}
