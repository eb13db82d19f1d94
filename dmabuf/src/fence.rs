//! Fences — one-shot completion latches.
//!
//! A fence stands for one asynchronous unit of work.  It starts unsignaled
//! and is signaled exactly once; any number of observers may block on it
//! ([`Fence::wait_timeout`]) or register a [`FenceCallback`].
//!
//! **Invariants:**
//! - `SIGNALED` never clears once set.
//! - `ENABLE_SIGNAL` is set only once the variant's arming hook succeeded.
//!   Hooks run one at a time under the fence's arm lock; observers that
//!   arrive meanwhile wait for the outcome, and if the hook failed the
//!   next of them runs it again.
//! - The waiter list is only touched with the fence lock held, and signal
//!   drains it with the lock held, so a waiter that queued before `signal`
//!   is always woken and one that checks after it always sees `SIGNALED`.
//! - Callbacks run with the fence lock held: they must not block, and must
//!   not call back into the fence that is dispatching them.  In return,
//!   once [`FenceCallback::cancel`] returns the callback will not start.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{error, trace, warn};
use spin::Mutex;

use crate::bikeshed::BikeshedFence;
use crate::error::{Error, Result};
use crate::wait::{WaitEntry, WaitMode};

bitflags! {
    /// Fence state word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FenceFlags: u32 {
        /// The operation completed.
        const SIGNALED = 1 << 0;
        /// An observer needed notification and the variant was armed.
        const ENABLE_SIGNAL = 1 << 1;
    }
}

// ── Outcomes ────────────────────────────────────────────────────

/// Result of [`Fence::signal`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStatus {
    /// This call signaled the fence and dispatched its waiters.
    Signaled,
    /// Somebody got there first; nothing happened.
    AlreadySignaled,
}

/// Result of [`Fence::add_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Queued; it will run when the fence signals unless canceled.
    Registered,
    /// The fence had already passed; the callback ran before returning.
    AlreadyPassed,
}

/// Result of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The caller blocked and was woken by the signal.  `remaining` is
    /// what was left of the timeout (`None` for untimed waits).
    Completed { remaining: Option<Duration> },
    /// Signaled before the call; nothing was armed and nothing blocked.
    AlreadyPassed,
}

/// What arming a variant for software notification found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arming {
    /// Notification armed; someone will call [`Fence::signal`].
    Armed,
    /// The operation is already complete; treat the fence as signaled.
    Passed,
}

// ── Variants ────────────────────────────────────────────────────

/// The closed set of fence implementations.
pub(crate) enum FenceKind {
    /// Pure software latch, signaled by whoever finishes the work.
    Software,
    /// Completion is a semaphore word in a shared buffer reaching a value.
    Bikeshed(BikeshedFence),
}

impl FenceKind {
    fn enable_signaling(&self, fence: &Fence) -> Result<Arming> {
        match self {
            FenceKind::Software => Ok(Arming::Armed),
            FenceKind::Bikeshed(bikeshed) => bikeshed.enable_signaling(fence),
        }
    }

    /// Has the underlying operation finished, signal or not?
    fn poll_signaled(&self) -> bool {
        match self {
            FenceKind::Software => false,
            FenceKind::Bikeshed(bikeshed) => bikeshed.passed(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FenceKind::Software => "software",
            FenceKind::Bikeshed(_) => "bikeshed",
        }
    }
}

// ── Fence ───────────────────────────────────────────────────────

/// Monotonically increasing fence id counter.
static NEXT_FENCE_ID: AtomicU64 = AtomicU64::new(1);

enum Waiter {
    Task(Arc<WaitEntry>),
    Callback(Arc<CallbackInner>),
}

struct FenceInner {
    id: u64,
    flags: AtomicU32,
    waiters: Mutex<Vec<Waiter>>,
    /// Serializes the variant's arming hook.
    arming: Mutex<()>,
    kind: FenceKind,
}

/// Shared handle to a fence.  Cloning takes a reference, dropping releases
/// it; the fence is destroyed with its last reference.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Create an unsignaled software fence.
    pub fn new() -> Self {
        Self::with_kind(FenceKind::Software)
    }

    /// Create a software fence that is already signaled.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence
            .inner
            .flags
            .store(FenceFlags::SIGNALED.bits(), Ordering::Release);
        fence
    }

    pub(crate) fn with_kind(kind: FenceKind) -> Self {
        let id = NEXT_FENCE_ID.fetch_add(1, Ordering::Relaxed);
        trace!("[fence] create {} ({})", id, kind.name());
        Self {
            inner: Arc::new(FenceInner {
                id,
                flags: AtomicU32::new(0),
                waiters: Mutex::new(Vec::new()),
                arming: Mutex::new(()),
                kind,
            }),
        }
    }

    /// Process-unique id, for logs.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Take another reference.
    pub fn get(&self) -> Fence {
        self.clone()
    }

    /// Release this reference.
    pub fn put(self) {}

    /// Number of live references, including this one.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(a: &Fence, b: &Fence) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn flags(&self) -> FenceFlags {
        FenceFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    /// The hardware-semaphore details, for bikeshed fences.
    pub fn bikeshed(&self) -> Option<&BikeshedFence> {
        match &self.inner.kind {
            FenceKind::Bikeshed(bikeshed) => Some(bikeshed),
            FenceKind::Software => None,
        }
    }

    /// Has the fence completed?
    ///
    /// Besides the flag, this asks the variant: a bikeshed fence whose
    /// semaphore already reached its target is signaled on the spot.
    pub fn is_signaled(&self) -> bool {
        if self.flags().contains(FenceFlags::SIGNALED) {
            return true;
        }
        if self.inner.kind.poll_signaled() {
            let _ = self.signal();
            return true;
        }
        false
    }

    /// Signal the fence: wake every blocked task and run every callback.
    ///
    /// Safe to call from any thread, including one that must not sleep.
    pub fn signal(&self) -> SignalStatus {
        // Waiters we wake may drop their references; keep the fence alive
        // until dispatch is over.
        let _hold = self.get();

        let released = {
            let mut waiters = self.inner.waiters.lock();
            let prev = self
                .inner
                .flags
                .fetch_or(FenceFlags::SIGNALED.bits(), Ordering::AcqRel);
            if prev & FenceFlags::SIGNALED.bits() != 0 {
                return SignalStatus::AlreadySignaled;
            }

            let mut released = Vec::new();
            for waiter in core::mem::take(&mut *waiters) {
                match waiter {
                    Waiter::Task(entry) => entry.wake(),
                    Waiter::Callback(cb) => {
                        if let Some(registration) = cb.fence.lock().take() {
                            released.push(registration);
                        }
                        (cb.func)(self);
                    }
                }
            }
            released
        };

        trace!(
            "[fence] signal {} ({} callback refs released)",
            self.inner.id,
            released.len()
        );
        drop(released);
        SignalStatus::Signaled
    }

    /// Arm the variant's notification the first time anyone needs it.
    ///
    /// Returns `Passed` if the fence turned out to be done already.  The
    /// hook must not wait on this fence or register callbacks on it.
    fn enable_signaling(&self) -> Result<Arming> {
        let armed = |flags: FenceFlags| {
            if flags.contains(FenceFlags::SIGNALED) {
                Some(Arming::Passed)
            } else if flags.contains(FenceFlags::ENABLE_SIGNAL) {
                Some(Arming::Armed)
            } else {
                None
            }
        };
        if let Some(arming) = armed(self.flags()) {
            return Ok(arming);
        }

        let _arm = self.inner.arming.lock();
        if let Some(arming) = armed(self.flags()) {
            return Ok(arming);
        }

        match self.inner.kind.enable_signaling(self) {
            Ok(arming) => {
                self.inner
                    .flags
                    .fetch_or(FenceFlags::ENABLE_SIGNAL.bits(), Ordering::AcqRel);
                if arming == Arming::Passed {
                    let _ = self.signal();
                }
                Ok(arming)
            }
            Err(e) => {
                // Left unarmed: the next observer runs the hook again.
                warn!("[fence] enable signaling on {} failed: {}", self.inner.id, e);
                Err(e)
            }
        }
    }

    /// Register `cb` to run when the fence signals.
    ///
    /// While registered, the callback holds a reference on the fence; the
    /// reference is released when it fires or is canceled.  If the fence
    /// has already passed, the callback runs immediately on this thread
    /// and `AlreadyPassed` is returned.
    pub fn add_callback(&self, cb: &FenceCallback) -> Result<CallbackStatus> {
        if cb.is_pending() {
            warn!("[fence] callback already registered (fence {})", self.inner.id);
            return Err(Error::Busy);
        }
        if !self.is_signaled() {
            self.enable_signaling()?;
        }

        {
            let mut waiters = self.inner.waiters.lock();
            if !self.flags().contains(FenceFlags::SIGNALED) {
                let mut registration = cb.inner.fence.lock();
                if registration.is_some() {
                    warn!("[fence] callback already registered (fence {})", self.inner.id);
                    return Err(Error::Busy);
                }
                *registration = Some(self.get());
                waiters.push(Waiter::Callback(cb.inner.clone()));
                return Ok(CallbackStatus::Registered);
            }
        }

        (cb.inner.func)(self);
        Ok(CallbackStatus::AlreadyPassed)
    }

    /// Unlink `cb` if it is still pending on this fence.
    ///
    /// Returns `false` if it already fired (or was never registered here).
    /// After this returns the callback will not start; it may still be
    /// finishing on the signaling thread only if this returned `false`.
    pub fn remove_callback(&self, cb: &FenceCallback) -> bool {
        let registration = {
            let mut waiters = self.inner.waiters.lock();
            let before = waiters.len();
            waiters.retain(|w| !matches!(w, Waiter::Callback(c) if Arc::ptr_eq(c, &cb.inner)));
            if waiters.len() == before {
                return false;
            }
            cb.inner.fence.lock().take()
        };
        drop(registration);
        true
    }

    /// Block until signaled (no timeout).
    pub fn wait(&self, mode: WaitMode) -> Result<WaitStatus> {
        self.wait_timeout(mode, None)
    }

    /// Block until signaled, interrupted (if `mode` allows) or `timeout`.
    pub fn wait_timeout(&self, mode: WaitMode, timeout: Option<Duration>) -> Result<WaitStatus> {
        if self.is_signaled() {
            return Ok(WaitStatus::AlreadyPassed);
        }
        if self.enable_signaling()? == Arming::Passed {
            return Ok(WaitStatus::AlreadyPassed);
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let remaining = || deadline.map(|d| d.saturating_duration_since(Instant::now()));

        let entry = {
            let mut waiters = self.inner.waiters.lock();
            if self.flags().contains(FenceFlags::SIGNALED) {
                return Ok(WaitStatus::Completed {
                    remaining: remaining(),
                });
            }
            let entry = WaitEntry::new();
            waiters.push(Waiter::Task(entry.clone()));
            entry
        };

        let res = entry.sleep(mode, deadline);
        if res.is_err() {
            self.inner
                .waiters
                .lock()
                .retain(|w| !matches!(w, Waiter::Task(e) if Arc::ptr_eq(e, &entry)));
        }

        match res {
            Ok(()) => Ok(WaitStatus::Completed {
                remaining: remaining(),
            }),
            // The signal drained us before we could leave: it won.
            Err(_) if entry.is_woken() => Ok(WaitStatus::Completed {
                remaining: remaining(),
            }),
            Err(e) => Err(e),
        }
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind.name())
            .field("flags", &self.flags())
            .finish()
    }
}

impl Drop for FenceInner {
    fn drop(&mut self) {
        let waiters = self.waiters.get_mut().len();
        if waiters != 0 {
            error!("[fence] fence {} destroyed with {} waiters", self.id, waiters);
        }
        debug_assert_eq!(waiters, 0, "fence destroyed while waiters remain");
    }
}

// ── Callbacks ───────────────────────────────────────────────────

struct CallbackInner {
    func: Box<dyn Fn(&Fence) + Send + Sync>,
    /// The fence this record is registered on, holding a reference to it.
    fence: Mutex<Option<Fence>>,
}

/// A completion callback record.
///
/// One record can be registered on at most one fence at a time.  Dropping
/// the handle cancels a pending registration, so keep it alive for as
/// long as the callback should stay armed.
pub struct FenceCallback {
    inner: Arc<CallbackInner>,
}

impl FenceCallback {
    pub fn new(func: impl Fn(&Fence) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(CallbackInner {
                func: Box::new(func),
                fence: Mutex::new(None),
            }),
        }
    }

    /// Registered and not yet fired or canceled?
    pub fn is_pending(&self) -> bool {
        self.inner.fence.lock().is_some()
    }

    /// Cancel the registration, wherever it is.  Returns whether a pending
    /// registration was removed.
    pub fn cancel(&self) -> bool {
        let fence = self.inner.fence.lock().clone();
        match fence {
            Some(fence) => fence.remove_callback(self),
            None => false,
        }
    }
}

impl Drop for FenceCallback {
    fn drop(&mut self) {
        // A pending registration and its fence reference each other.
        self.cancel();
    }
}

impl fmt::Debug for FenceCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fence = self.inner.fence.lock().as_ref().map(Fence::id);
        f.debug_struct("FenceCallback").field("fence", &fence).finish()
    }
}
