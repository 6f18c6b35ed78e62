mod semaphore;
mod spin;

pub use semaphore::*;
pub use spin::*;
