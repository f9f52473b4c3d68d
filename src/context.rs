//! Execution context identity
//!
//! Pool allocation and transaction state are keyed by an explicit
//! [`ExecutionContext`] value passed through `hold`/`transaction` rather
//! than by ambient thread inspection inside the data structures. The
//! facade resolves [`ExecutionContext::current`] once at its outer
//! binding and threads it down from there.

use std::thread::ThreadId;

/// Identity of the execution unit that owns a checked-out connection.
///
/// Two holds with the same context are reentrant: they observe the same
/// connection without blocking or allocating a second one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionContext(ThreadId);

impl ExecutionContext {
	/// The context of the calling thread.
	pub fn current() -> Self {
		ExecutionContext(std::thread::current().id())
	}
}
