//! Reservation table — per-buffer reservation state under one lock.
//!
//! Every [`DmaBuf`](crate::DmaBuf) registered in a table owns one slot
//! here: its reserved flag, the ticket of the reservation holding it, the
//! exclusive fence slot and a fixed array of shared fence slots.  A single
//! mutex covers all of it; operations under it only flip flags and clone
//! or move fence handles, never block.
//!
//! **Invariants:**
//! - A buffer is reserved by at most one ticket at a time.
//! - Shared slots never exceed [`MAX_SHARED_FENCES`]; overflow is refused,
//!   never truncated.
//! - Fence handles are never dropped with the table lock held (the last
//!   reference to a bikeshed fence may own the last reference to a buffer,
//!   whose teardown takes this lock).

pub mod validate;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{trace, warn};

use crate::buffer::BufferId;
use crate::config::MAX_SHARED_FENCES;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::wait::WaitQueue;

// ── Fixed fence arrays ──────────────────────────────────────────

/// Up to `N` fence references, filled front to back.
pub(crate) struct FenceSlots<const N: usize> {
	slots: [Option<Fence>; N],
	count: usize,
}

impl<const N: usize> FenceSlots<N> {
	pub(crate) fn new() -> Self {
		Self {
			slots: std::array::from_fn(|_| None),
			count: 0,
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.count
	}

	pub(crate) fn is_full(&self) -> bool {
		self.count == N
	}

	/// Append a fence.  Refuses (and hands back nothing) when full.
	pub(crate) fn push(&mut self, fence: Fence) -> Result {
		if self.is_full() {
			return Err(Error::SharedSlotsFull);
		}
		self.slots[self.count] = Some(fence);
		self.count += 1;
		Ok(())
	}

	pub(crate) fn iter(&self) -> impl Iterator<Item = &Fence> {
		self.slots[..self.count].iter().flatten()
	}

	/// Empty the array, returning the references it held.
	pub(crate) fn take_all(&mut self) -> Vec<Fence> {
		let taken = self.slots[..self.count].iter_mut().filter_map(Option::take).collect();
		self.count = 0;
		taken
	}
}

// ── Per-buffer state ────────────────────────────────────────────

pub(crate) struct ResvState {
	pub(crate) reserved: bool,
	/// Ticket of the holder; `None` while unreserved.
	pub(crate) ticket: Option<u64>,
	pub(crate) excl: Option<Fence>,
	pub(crate) shared: FenceSlots<MAX_SHARED_FENCES>,
}

impl ResvState {
	fn new() -> Self {
		Self {
			reserved: false,
			ticket: None,
			excl: None,
			shared: FenceSlots::new(),
		}
	}

	/// Move every attached fence out.
	fn take_fences(&mut self) -> Vec<Fence> {
		let mut fences = self.shared.take_all();
		fences.extend(self.excl.take());
		fences
	}
}

struct Slot {
	generation: u32,
	state: Option<ResvState>,
}

/// Everything the table lock protects.
pub(crate) struct TableState {
	slots: Vec<Slot>,
	/// Next reservation ticket.  Starts at 1 and only grows.
	next_ticket: u64,
	live: usize,
}

impl TableState {
	fn new() -> Self {
		Self {
			slots: Vec::new(),
			next_ticket: 1,
			live: 0,
		}
	}

	pub(crate) fn draw_ticket(&mut self) -> u64 {
		let ticket = self.next_ticket;
		self.next_ticket += 1;
		ticket
	}

	/// Take the first free slot (or grow) and return its id.
	fn insert(&mut self) -> BufferId {
		self.live += 1;
		for (i, slot) in self.slots.iter_mut().enumerate() {
			if slot.state.is_none() {
				slot.state = Some(ResvState::new());
				return BufferId::pack(slot.generation, i);
			}
		}
		self.slots.push(Slot {
			generation: 0,
			state: Some(ResvState::new()),
		});
		BufferId::pack(0, self.slots.len() - 1)
	}

	/// Free the slot behind `id`, bumping its generation.
	fn remove(&mut self, id: BufferId) -> Option<ResvState> {
		let (generation, index) = id.unpack();
		let slot = self.slots.get_mut(index)?;
		if slot.generation != generation {
			return None;
		}
		let removed = slot.state.take()?;
		slot.generation = generation.wrapping_add(1);
		self.live -= 1;
		Some(removed)
	}

	pub(crate) fn get(&self, id: BufferId) -> Option<&ResvState> {
		let (generation, index) = id.unpack();
		let slot = self.slots.get(index)?;
		if slot.generation != generation {
			return None;
		}
		slot.state.as_ref()
	}

	pub(crate) fn get_mut(&mut self, id: BufferId) -> Option<&mut ResvState> {
		let (generation, index) = id.unpack();
		let slot = self.slots.get_mut(index)?;
		if slot.generation != generation {
			return None;
		}
		slot.state.as_mut()
	}
}

// ── Table ───────────────────────────────────────────────────────

struct TableInner {
	state: Mutex<TableState>,
	/// Tasks waiting for some buffer to become unreserved.
	unreserved: WaitQueue,
}

/// Owner of the reservation state of a family of buffers.
///
/// Cloning shares the same table.  Buffers keep their table alive, so it
/// is torn down only after the last buffer registered in it.
#[derive(Clone)]
pub struct ReservationTable {
	inner: Arc<TableInner>,
}

impl ReservationTable {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(TableInner {
				state: Mutex::new(TableState::new()),
				unreserved: WaitQueue::new(),
			}),
		}
	}

	pub fn ptr_eq(a: &ReservationTable, b: &ReservationTable) -> bool {
		Arc::ptr_eq(&a.inner, &b.inner)
	}

	/// Lock the table.  State is only flags and handles, so a panic in
	/// another holder leaves nothing half-updated worth refusing.
	pub(crate) fn lock(&self) -> MutexGuard<'_, TableState> {
		self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub(crate) fn wake_unreserved(&self) -> usize {
		self.inner.unreserved.wake_all()
	}

	pub(crate) fn unreserved_queue(&self) -> &WaitQueue {
		&self.inner.unreserved
	}

	/// Number of buffers currently registered.
	pub fn buffer_count(&self) -> usize {
		self.lock().live
	}

	pub(crate) fn register(&self) -> BufferId {
		self.lock().insert()
	}

	/// Drop a buffer's slot and every fence attached to it.
	pub(crate) fn unregister(&self, id: BufferId) {
		let removed = self.lock().remove(id);
		let Some(mut resv) = removed else {
			warn!("[resv] unregister of unknown buffer {}", id);
			return;
		};
		if resv.reserved {
			warn!("[resv] buffer {} released while reserved", id);
			self.wake_unreserved();
		}
		let fences = resv.take_fences();
		trace!("[resv] buffer {} unregistered, {} fences released", id, fences.len());
		drop(fences);
	}

	pub(crate) fn is_reserved(&self, id: BufferId) -> bool {
		self.lock().get(id).is_some_and(|r| r.reserved)
	}

	pub(crate) fn ticket(&self, id: BufferId) -> Option<u64> {
		self.lock().get(id).and_then(|r| r.ticket)
	}

	pub(crate) fn exclusive_fence(&self, id: BufferId) -> Option<Fence> {
		self.lock().get(id).and_then(|r| r.excl.clone())
	}

	pub(crate) fn shared_fences(&self, id: BufferId) -> Vec<Fence> {
		self.lock()
			.get(id)
			.map(|r| r.shared.iter().cloned().collect())
			.unwrap_or_default()
	}
}

impl Default for ReservationTable {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for ReservationTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.lock();
		f.debug_struct("ReservationTable")
			.field("buffers", &state.live)
			.field("next_ticket", &state.next_ticket)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fence_slots_refuse_overflow() {
		let mut slots: FenceSlots<2> = FenceSlots::new();
		let a = Fence::new();
		slots.push(a.clone()).unwrap();
		slots.push(Fence::new()).unwrap();
		assert!(slots.is_full());
		assert_eq!(slots.push(Fence::new()), Err(Error::SharedSlotsFull));
		assert_eq!(slots.len(), 2);
		assert_eq!(a.refcount(), 2);

		let taken = slots.take_all();
		assert_eq!(taken.len(), 2);
		assert_eq!(slots.len(), 0);
		assert_eq!(slots.iter().count(), 0);
		drop(taken);
		assert_eq!(a.refcount(), 1);
	}

	#[test]
	fn tickets_grow() {
		let mut state = TableState::new();
		let a = state.draw_ticket();
		let b = state.draw_ticket();
		assert!(b > a);
	}

	#[test]
	fn stale_ids_are_rejected() {
		let mut state = TableState::new();
		let id = state.insert();
		assert!(state.get(id).is_some());
		assert!(state.remove(id).is_some());
		assert!(state.get(id).is_none());
		assert!(state.remove(id).is_none());

		let reused = state.insert();
		assert_ne!(reused, id);
		assert!(state.get_mut(id).is_none());
		assert!(state.get_mut(reused).is_some());
		assert_eq!(state.live, 1);
	}
}
