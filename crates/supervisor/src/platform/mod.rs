//! Platform-specific signal dispatch for graceful subprocess shutdown.

#[cfg(unix)]
mod unix;
#[cfg(not(unix))]
mod windows;

#[cfg(unix)]
pub use unix::{force_kill, terminate};
#[cfg(not(unix))]
pub use windows::{force_kill, terminate};
