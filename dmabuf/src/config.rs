//! Compile-time tunables.
//!
//! These size fixed arrays and bound waits; changing them changes memory
//! layout of every buffer's reservation state, so they are consts rather
//! than runtime knobs.

use std::time::Duration;

/// Shared (reader) fence slots per buffer.
///
/// Reserving a buffer for shared access when all slots are taken is a
/// usage error, not contention.
pub const MAX_SHARED_FENCES: usize = 4;

/// Fences a validation entry can capture at reservation time: every
/// shared fence plus the exclusive one.
pub const MAX_CAPTURED_FENCES: usize = MAX_SHARED_FENCES + 1;

/// Per-fence bound for [`wait_completed_cpu`](crate::wait_completed_cpu).
pub const CPU_WAIT_TIMEOUT: Duration = Duration::from_secs(4);

/// Size (and required alignment) of a bikeshed semaphore word.
pub const SEMAPHORE_WORD_SIZE: usize = 4;
