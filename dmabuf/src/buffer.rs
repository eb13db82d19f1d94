//! Shareable buffers.
//!
//! A [`DmaBuf`] is the object every engine passes around: a block of
//! memory (here only the 32-bit words a peer engine uses as semaphores)
//! plus an identity in a [`ReservationTable`] where its reservation state
//! and attached fences live.
//!
//! **Identity invariants:**
//! - Ids are generation-guarded composites `(generation << 32 | index)`.
//!   When the last reference goes away the table slot is freed and its
//!   generation bumped, so a stale id never aliases a newer buffer.
//! - Two handles are the same buffer iff their ids are equal.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{trace, warn};

use crate::config::SEMAPHORE_WORD_SIZE;
use crate::error::{Error, Result};
use crate::fence::Fence;
use crate::resv::ReservationTable;

// ── Composite id ────────────────────────────────────────────────

/// Stable identity of a buffer within its reservation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
	/// Pack a (generation, index) pair.
	#[inline]
	pub(crate) fn pack(generation: u32, index: usize) -> Self {
		Self(((generation as u64) << 32) | (index as u64 & 0xFFFF_FFFF))
	}

	/// Unpack into (generation, index).
	#[inline]
	pub(crate) fn unpack(self) -> (u32, usize) {
		let generation = (self.0 >> 32) as u32;
		let index = (self.0 & 0xFFFF_FFFF) as usize;
		(generation, index)
	}

	pub fn as_raw(self) -> u64 {
		self.0
	}
}

impl fmt::Display for BufferId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let (generation, index) = self.unpack();
		write!(f, "{}.{}", index, generation)
	}
}

// ── Buffer ──────────────────────────────────────────────────────

struct DmaBufInner {
	id: BufferId,
	size: usize,
	words: Box<[AtomicU32]>,
	table: ReservationTable,
}

/// Shared handle to a buffer.  Cloning takes a reference; the buffer is
/// unregistered from its table (and its attached fences released) with
/// the last one.
#[derive(Clone)]
pub struct DmaBuf {
	inner: Arc<DmaBufInner>,
}

impl DmaBuf {
	/// Allocate a zero-filled buffer of `size` bytes in `table`.
	pub fn new(table: &ReservationTable, size: usize) -> Self {
		let id = table.register();
		let words = (0..size.div_ceil(SEMAPHORE_WORD_SIZE))
			.map(|_| AtomicU32::new(0))
			.collect();
		trace!("[dmabuf] new buffer {} ({} bytes)", id, size);
		Self {
			inner: Arc::new(DmaBufInner {
				id,
				size,
				words,
				table: table.clone(),
			}),
		}
	}

	pub fn id(&self) -> BufferId {
		self.inner.id
	}

	/// Size in bytes.
	pub fn len(&self) -> usize {
		self.inner.size
	}

	pub fn is_empty(&self) -> bool {
		self.inner.size == 0
	}

	pub fn table(&self) -> &ReservationTable {
		&self.inner.table
	}

	/// Number of live handles, including this one.
	pub fn refcount(&self) -> usize {
		Arc::strong_count(&self.inner)
	}

	/// Validate a semaphore offset and return its word index.
	///
	/// The word must be aligned and lie entirely inside the buffer.
	pub(crate) fn semaphore_index(&self, offset: usize) -> Result<usize> {
		if offset % SEMAPHORE_WORD_SIZE != 0 || offset / SEMAPHORE_WORD_SIZE >= self.inner.words.len() {
			warn!("[dmabuf] bad semaphore offset {:#x} in buffer {}", offset, self.inner.id);
			return Err(Error::InvalidArgument);
		}
		if offset + SEMAPHORE_WORD_SIZE > self.inner.size {
			warn!("[dmabuf] semaphore at {:#x} overruns buffer {}", offset, self.inner.id);
			return Err(Error::InvalidArgument);
		}
		Ok(offset / SEMAPHORE_WORD_SIZE)
	}

	/// Read the semaphore word at byte `offset`.
	pub fn read_semaphore(&self, offset: usize) -> Result<u32> {
		let index = self.semaphore_index(offset)?;
		Ok(self.inner.words[index].load(Ordering::Acquire))
	}

	/// Store `value` into the semaphore word at byte `offset`, the way a
	/// peer engine reports progress.
	pub fn write_semaphore(&self, offset: usize, value: u32) -> Result {
		let index = self.semaphore_index(offset)?;
		self.inner.words[index].store(value, Ordering::Release);
		Ok(())
	}

	/// Is the buffer currently reserved by anyone?
	pub fn is_reserved(&self) -> bool {
		self.inner.table.is_reserved(self.inner.id)
	}

	/// Ticket of the reservation holding the buffer, if reserved.
	pub fn reservation_ticket(&self) -> Option<u64> {
		self.inner.table.ticket(self.inner.id)
	}

	/// The attached exclusive (writer) fence.
	pub fn exclusive_fence(&self) -> Option<Fence> {
		self.inner.table.exclusive_fence(self.inner.id)
	}

	/// The attached shared (reader) fences.
	pub fn shared_fences(&self) -> Vec<Fence> {
		self.inner.table.shared_fences(self.inner.id)
	}
}

impl PartialEq for DmaBuf {
	fn eq(&self, other: &Self) -> bool {
		self.inner.id == other.inner.id && ReservationTable::ptr_eq(&self.inner.table, &other.inner.table)
	}
}

impl Eq for DmaBuf {}

impl fmt::Debug for DmaBuf {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DmaBuf")
			.field("id", &self.inner.id)
			.field("size", &self.inner.size)
			.finish()
	}
}

impl Drop for DmaBufInner {
	fn drop(&mut self) {
		trace!("[dmabuf] release buffer {}", self.id);
		self.table.unregister(self.id);
	}
}
