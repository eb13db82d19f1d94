// =============================================================================
// dmabuf-sync — Crate Root
// =============================================================================
//
// Cross-device synchronization for shared buffers.
//
// A GPU, a DSP and the CPU may all read and write the same buffer. Nobody
// wants to block the whole pipeline to do that safely, so two primitives
// cooperate:
//
//   - A FENCE is a one-shot latch: "the operation I stand for has finished."
//     Any number of observers may wait on it or register callbacks; it is
//     signaled exactly once.
//
//   - A RESERVATION claims a set of buffers for one prepare → submit →
//     commit cycle. While reserved, the claimant learns which fences it must
//     wait behind, and on commit it attaches its own fence to each buffer.
//
// FLOW:
//   1. Producer builds a validation list: [(buffer, shared|exclusive), ...]
//   2. ReservationTable::reserve() claims every buffer or none, using
//      tickets to break lock-order cycles between concurrent producers
//   3. Producer waits on (or chains after) the captured fences
//   4. Producer submits work, then fence_and_release() attaches the work's
//      fence to every buffer and drops the claims
//
// LOCKING:
//   Level 1 (innermost): per-fence spin lock (waiters, callbacks)
//   Level 2: per-fence arm lock (held across the enable-signaling hook,
//            which may signal and so take level 1)
//   Level 3: wait-queue spin locks
//   Level 4 (outermost): reservation table mutex
//
//   Fence callbacks run with the fence lock held and must not block or call
//   back into the fence that is dispatching them. Fences are never dropped
//   while the table mutex is held (a bikeshed fence may own the last
//   reference to a buffer, whose drop takes the table mutex).
// =============================================================================

pub mod bikeshed;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fence;
pub mod resv;
pub mod task;
pub mod wait;

pub use bikeshed::{bikeshed_fence_create, BikeshedFence, EnableSignalingFn};
pub use buffer::{BufferId, DmaBuf};
pub use error::{Error, Result};
pub use fence::{Arming, CallbackStatus, Fence, FenceCallback, SignalStatus, WaitStatus};
pub use resv::validate::{wait_completed_cpu, Access, ValidateEntry};
pub use resv::ReservationTable;
pub use task::Task;
pub use wait::WaitMode;
