//! Bikeshed fences — completion through a semaphore word in a buffer.
//!
//! Two engines that share a buffer can synchronize without the CPU: the
//! producer writes an increasing sequence value into a 32-bit word of the
//! buffer, and the consumer polls (or its hardware waits on) that word
//! until it reaches the target.  The fence is "passed" once
//! `word - seqno` is non-negative in wrapping arithmetic.
//!
//! Software observers need more than that: somebody has to call
//! [`Fence::signal`](crate::Fence::signal).  The creator supplies an
//! enable-signaling hook which arms that notification (an interrupt, a
//! command in the ring) the first time a CPU waiter shows up.
//!
//! The fence holds a strong reference on its buffer, so the semaphore
//! word stays valid for as long as the fence does.  A fence attached to
//! its own backing buffer keeps that buffer alive until the slot is
//! replaced.

use std::fmt;

use log::warn;

use crate::buffer::DmaBuf;
use crate::error::{Error, Result};
use crate::fence::{Arming, Fence, FenceKind};

/// Hook that arms software notification for a bikeshed fence.
///
/// It receives the fence (use [`Fence::bikeshed`] for the semaphore
/// details) and must arrange for `signal()` to be called once the word
/// passes.  Calls are serialized per fence and repeat only after a
/// failure; the fence lock is never held while it runs.
pub type EnableSignalingFn = Box<dyn Fn(&Fence) -> Result<Arming> + Send + Sync>;

/// Hardware-semaphore details of a bikeshed fence.
pub struct BikeshedFence {
    buf: DmaBuf,
    offset: usize,
    seqno: u32,
    enable: EnableSignalingFn,
}

impl BikeshedFence {
    /// The buffer holding the semaphore word.
    pub fn buffer(&self) -> &DmaBuf {
        &self.buf
    }

    /// Byte offset of the semaphore word.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Value that marks completion.
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Has the semaphore word reached the target?
    pub fn passed(&self) -> bool {
        self.buf
            .read_semaphore(self.offset)
            .is_ok_and(|value| seqno_passed(value, self.seqno))
    }

    pub(crate) fn enable_signaling(&self, fence: &Fence) -> Result<Arming> {
        let arming = (self.enable)(fence)?;
        // The word may have passed before the notification was armed, in
        // which case nobody would ever signal.
        if arming == Arming::Armed && self.passed() {
            return Ok(Arming::Passed);
        }
        Ok(arming)
    }
}

impl fmt::Debug for BikeshedFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BikeshedFence")
            .field("buf", &self.buf.id())
            .field("offset", &self.offset)
            .field("seqno", &self.seqno)
            .finish()
    }
}

/// Wrap-aware `current >= target`.
#[inline]
fn seqno_passed(current: u32, target: u32) -> bool {
    (current.wrapping_sub(target) as i32) >= 0
}

/// Create a bikeshed fence waiting for the word at `offset` in `buf` to
/// reach `seqno`.
///
/// Both the buffer and the hook are required; a missing one, or an
/// offset that is not an aligned word inside the buffer, is
/// `Error::InvalidArgument`.
pub fn bikeshed_fence_create(
    buf: Option<&DmaBuf>,
    offset: usize,
    seqno: u32,
    enable: Option<EnableSignalingFn>,
) -> Result<Fence> {
    let (Some(buf), Some(enable)) = (buf, enable) else {
        warn!("[bikeshed] fence needs both a buffer and an enable-signaling hook");
        return Err(Error::InvalidArgument);
    };
    buf.semaphore_index(offset)?;

    Ok(Fence::with_kind(FenceKind::Bikeshed(BikeshedFence {
        buf: buf.clone(),
        offset,
        seqno,
        enable,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::{SignalStatus, WaitStatus};
    use crate::resv::ReservationTable;
    use crate::wait::WaitMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn armed() -> EnableSignalingFn {
        Box::new(|_| Ok(Arming::Armed))
    }

    #[test]
    fn wraparound_comparison() {
        assert!(seqno_passed(5, 5));
        assert!(seqno_passed(6, 5));
        assert!(!seqno_passed(4, 5));
        assert!(seqno_passed(2, u32::MAX - 1));
        assert!(!seqno_passed(u32::MAX - 1, 2));
    }

    #[test]
    fn create_rejects_missing_or_bad_arguments() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 64);

        assert_eq!(bikeshed_fence_create(None, 0, 1, Some(armed())).err(), Some(Error::InvalidArgument));
        assert_eq!(bikeshed_fence_create(Some(&buf), 0, 1, None).err(), Some(Error::InvalidArgument));
        assert_eq!(bikeshed_fence_create(Some(&buf), 3, 1, Some(armed())).err(), Some(Error::InvalidArgument));
        assert_eq!(bikeshed_fence_create(Some(&buf), 64, 1, Some(armed())).err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn fence_holds_buffer_reference() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 64);
        let fence = bikeshed_fence_create(Some(&buf), 8, 1, Some(armed())).unwrap();
        assert_eq!(buf.refcount(), 2);
        assert_eq!(fence.bikeshed().map(BikeshedFence::offset), Some(8));

        drop(buf);
        let shed = fence.bikeshed().unwrap();
        assert_eq!(table.buffer_count(), 1);
        shed.buffer().write_semaphore(8, 1).unwrap();
        assert!(fence.is_signaled());

        drop(fence);
        assert_eq!(table.buffer_count(), 0);
    }

    #[test]
    fn polling_sees_semaphore_write() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);
        let fence = bikeshed_fence_create(Some(&buf), 4, 10, Some(armed())).unwrap();

        buf.write_semaphore(4, 9).unwrap();
        assert!(!fence.is_signaled());
        buf.write_semaphore(4, 10).unwrap();
        assert!(fence.is_signaled());
        assert_eq!(fence.signal(), SignalStatus::AlreadySignaled);
    }

    #[test]
    fn enable_hook_runs_once() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fence = bikeshed_fence_create(
            Some(&buf),
            0,
            1,
            Some(Box::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Arming::Armed)
            })),
        )
        .unwrap();

        let timeout = Some(Duration::from_millis(5));
        assert_eq!(fence.wait_timeout(WaitMode::Uninterruptible, timeout), Err(Error::TimedOut));
        assert_eq!(fence.wait_timeout(WaitMode::Uninterruptible, timeout), Err(Error::TimedOut));
        let cb = crate::fence::FenceCallback::new(|_| {});
        fence.add_callback(&cb).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cb.cancel());
    }

    #[test]
    fn hook_reporting_passed_signals_fence() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);
        let fence = bikeshed_fence_create(Some(&buf), 0, 1, Some(Box::new(|_| Ok(Arming::Passed)))).unwrap();

        let status = fence.wait_timeout(WaitMode::Uninterruptible, Some(Duration::from_secs(1)));
        assert_eq!(status, Ok(WaitStatus::AlreadyPassed));
        assert!(fence.is_signaled());
    }

    #[test]
    fn hook_failure_propagates_and_allows_retry() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);
        let fail = Arc::new(AtomicUsize::new(1));
        let f = fail.clone();
        let fence = bikeshed_fence_create(
            Some(&buf),
            0,
            1,
            Some(Box::new(move |_| {
                if f.fetch_sub(1, Ordering::SeqCst) > 0 {
                    Err(Error::InvalidArgument)
                } else {
                    Ok(Arming::Armed)
                }
            })),
        )
        .unwrap();

        let cb = crate::fence::FenceCallback::new(|_| {});
        assert_eq!(fence.add_callback(&cb), Err(Error::InvalidArgument));
        assert!(fence.add_callback(&cb).is_ok());
        assert!(cb.cancel());
    }

    #[test]
    fn word_passing_during_arming_reports_already_passed() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);
        let engine = buf.clone();
        let fence = bikeshed_fence_create(
            Some(&buf),
            0,
            7,
            Some(Box::new(move |_| {
                engine.write_semaphore(0, 7)?;
                Ok(Arming::Armed)
            })),
        )
        .unwrap();

        assert_eq!(fence.wait(WaitMode::Uninterruptible), Ok(WaitStatus::AlreadyPassed));
        assert!(fence.is_signaled());
    }

    #[test]
    fn waiter_arriving_during_failed_arming_rearms() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);
        let calls = Arc::new(AtomicUsize::new(0));
        let irq: Arc<Mutex<Vec<Fence>>> = Arc::new(Mutex::new(Vec::new()));

        let (c, armed_list) = (calls.clone(), irq.clone());
        let fence = bikeshed_fence_create(
            Some(&buf),
            0,
            1,
            Some(Box::new(move |fence| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(100));
                    return Err(Error::InvalidArgument);
                }
                armed_list.lock().unwrap().push(fence.get());
                Ok(Arming::Armed)
            })),
        )
        .unwrap();

        let first = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait_timeout(WaitMode::Uninterruptible, Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        let second = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait_timeout(WaitMode::Uninterruptible, Some(Duration::from_secs(5))))
        };

        thread::sleep(Duration::from_millis(200));
        buf.write_semaphore(0, 1).unwrap();
        for armed in core::mem::take(&mut *irq.lock().unwrap()) {
            let _ = armed.signal();
        }

        let first = first.join().unwrap();
        let second = second.join().unwrap();
        assert_eq!(first, Err(Error::InvalidArgument));
        assert!(second.is_ok(), "second waiter: {:?}", second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn simulated_engine_interrupt_signals_waiter() {
        let table = ReservationTable::new();
        let buf = DmaBuf::new(&table, 16);

        // Fences armed for an "interrupt" on this engine.
        let irq: Arc<Mutex<Vec<Fence>>> = Arc::new(Mutex::new(Vec::new()));
        let armed_list = irq.clone();
        let fence = bikeshed_fence_create(
            Some(&buf),
            0,
            3,
            Some(Box::new(move |fence| {
                armed_list.lock().unwrap().push(fence.get());
                Ok(Arming::Armed)
            })),
        )
        .unwrap();

        let engine = {
            let buf = buf.clone();
            let irq = irq.clone();
            thread::spawn(move || {
                for seq in 1..=3 {
                    thread::sleep(Duration::from_millis(10));
                    buf.write_semaphore(0, seq).unwrap();
                }
                // Interrupt handler: signal every armed fence that passed.
                let fences = core::mem::take(&mut *irq.lock().unwrap());
                for fence in fences {
                    if fence.bikeshed().is_some_and(BikeshedFence::passed) {
                        let _ = fence.signal();
                    }
                }
            })
        };

        let status = fence.wait_timeout(WaitMode::Uninterruptible, Some(Duration::from_secs(5)));
        assert!(matches!(status, Ok(WaitStatus::Completed { .. }) | Ok(WaitStatus::AlreadyPassed)));
        engine.join().unwrap();
    }
}
