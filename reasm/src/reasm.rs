//! Reassembly pool handle.
//!
//! [`Reasm`] is a joined view of a pool laid out in caller-owned memory. It is
//! the only writer of the pool: every mutating operation takes `&mut self`,
//! and none of them lock, allocate, or perform atomic read-modify-write.
//!
//! # Slot Distribution
//!
//! Exactly `depth` slots are published at all times, one per ring line, and
//! the remaining `burst` slots sit on the free list as Free or Busy. A fresh or
//! reset pool publishes slots `0..depth` on lines `0..depth` and leaves slots
//! `depth..depth+burst` free:
//!
//! ```text
//!  depth=4, burst=2
//!
//!  index map   line: 0  1  2  3          free list
//!              slot: 0  1  2  3          head -> 5 -> 4 <- tail
//! ```
//!
//! Publishing a Busy slot to line `L` swaps it with the slot that owned `L`,
//! which returns to the free list tail and becomes the next slot handed out
//! by [`Reasm::prepare`].

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, trace, warn};

use crate::error::{AppendError, Appended, Corruption, PublishError, ReasmError};
use crate::layout::{
    self, CHUNK_STRIDE, Header, MAX_MESSAGE_SIZE, ORIGIN_MAX, REASM_ALIGN, REASM_MAGIC,
    laddr_to_chunk,
};
use crate::mcache::{Frag, Mcache, frag_ctl, line_idx};
use crate::metrics::PoolMetrics;
use crate::region::{HugepageSize, Region, allocate};
use crate::slot::{SLOT_IDX_NONE, Slot, SlotId, SlotInfo, SlotState};
use crate::slotq::SlotQueue;

/// A joined reassembly pool.
///
/// The lifetime ties the handle to the memory it was joined from; dropping
/// the handle (or calling [`leave`](Self::leave)) detaches without touching
/// the pool.
pub struct Reasm<'a> {
    hdr: NonNull<Header>,
    pub_slots: NonNull<u32>,
    slots: NonNull<Slot>,
    chunks: NonNull<u8>,
    depth: u32,
    slot_cnt: u32,
    orig: u16,
    _region: PhantomData<&'a mut [u8]>,
}

// SAFETY: the handle owns writer access to the pool for 'a; moving it to
// another thread moves that access with it.
unsafe impl Send for Reasm<'_> {}

impl<'a> Reasm<'a> {
    /// Lay out a new pool in `region` and join it.
    ///
    /// Fails without modifying the region if `depth` is not a power of two,
    /// `burst < 2`, `orig` exceeds [`ORIGIN_MAX`], or the region is smaller
    /// than [`layout::footprint`].
    pub fn new(region: &'a mut Region, depth: u64, burst: u64, orig: u64) -> Result<Self, ReasmError> {
        // SAFETY: the region is a live mapping of `len()` bytes, exclusively
        // borrowed for 'a.
        unsafe { Self::new_raw(region.as_ptr(), region.len(), depth, burst, orig) }
    }

    /// Lay out a new pool at `shmem` and join it.
    ///
    /// # Safety
    ///
    /// `shmem` must be null or valid for reads and writes of `shmem_sz` bytes
    /// for 'a, and no other handle may be joined to it while the returned
    /// handle is live.
    pub unsafe fn new_raw(
        shmem: *mut u8,
        shmem_sz: usize,
        depth: u64,
        burst: u64,
        orig: u64,
    ) -> Result<Self, ReasmError> {
        let base = layout::check_base(shmem, REASM_ALIGN)?;
        layout::validate(depth, burst)?;
        if orig > ORIGIN_MAX {
            return Err(ReasmError::InvalidOrigin(orig));
        }
        let offsets = layout::offsets(depth, burst).ok_or(ReasmError::RegionTooSmall {
            have: shmem_sz,
            need: usize::MAX,
        })?;
        if shmem_sz < offsets.footprint {
            return Err(ReasmError::RegionTooSmall {
                have: shmem_sz,
                need: offsets.footprint,
            });
        }

        let hdr = base.cast::<Header>();
        let h = hdr.as_ptr();
        // SAFETY: the region is aligned and large enough for the metadata
        // area; the caller guarantees exclusive access. A joiner may load the
        // magic concurrently, so it is cleared atomically before anything
        // else changes and left out of the zeroing.
        unsafe {
            (*h).magic.store(0, Ordering::Release);
            let magic_sz = size_of::<AtomicU64>();
            ptr::write_bytes(base.as_ptr().add(magic_sz), 0, offsets.chunks - magic_sz);
            (*h).pub_slots_off = offsets.pub_slots as u64;
            (*h).slots_off = offsets.slots as u64;
            (*h).chunks_off = offsets.chunks as u64;
            (*h).depth = depth as u32;
            (*h).burst = burst as u32;
            (*h).slot_cnt = (depth + burst) as u32;
            (*h).head = SLOT_IDX_NONE;
            (*h).tail = SLOT_IDX_NONE;
            (*h).orig = orig as u16;
        }

        // SAFETY: header just written with offsets inside the region.
        let mut reasm = unsafe { Self::from_header(hdr) };
        reasm.reset();

        // Publishing the magic last makes every write above visible to a
        // joiner that observes it.
        reasm.magic().store(REASM_MAGIC, Ordering::Release);

        debug!(
            depth,
            burst,
            orig,
            footprint = offsets.footprint,
            "created reassembly pool"
        );
        Ok(reasm)
    }

    /// Join an existing pool in `region`.
    pub fn join(region: &'a mut Region) -> Result<Self, ReasmError> {
        let len = region.len();
        // SAFETY: the region is a live mapping exclusively borrowed for 'a.
        let reasm = unsafe { Self::join_raw(region.as_ptr())? };
        if reasm.footprint() > len {
            warn!(len, footprint = reasm.footprint(), "pool larger than its region");
            return Err(ReasmError::RegionTooSmall {
                have: len,
                need: reasm.footprint(),
            });
        }
        Ok(reasm)
    }

    /// Join an existing pool at `shmem`.
    ///
    /// Performs no writes. Fails with [`ReasmError::BadMagic`] if the memory
    /// does not hold a live pool.
    ///
    /// # Safety
    ///
    /// `shmem` must be null or point to memory that stays mapped for 'a and
    /// covers the pool's footprint if it holds one. No other handle may be
    /// joined to it while the returned handle is live.
    pub unsafe fn join_raw(shmem: *mut u8) -> Result<Self, ReasmError> {
        let base = layout::check_base(shmem, REASM_ALIGN)?;
        let hdr = base.cast::<Header>();
        let h = hdr.as_ptr();

        // SAFETY: the header is within the mapping; magic is atomic so a
        // concurrent constructor or delete is tolerated.
        let magic = unsafe { (*h).magic.load(Ordering::Acquire) };
        if magic != REASM_MAGIC {
            warn!(addr = base.as_ptr() as usize, "bad magic");
            return Err(ReasmError::BadMagic);
        }

        // SAFETY: the magic guarantees a fully initialized header.
        let (depth, burst, slot_cnt, offs) = unsafe {
            (
                (*h).depth as u64,
                (*h).burst as u64,
                (*h).slot_cnt as u64,
                ((*h).pub_slots_off, (*h).slots_off, (*h).chunks_off),
            )
        };
        let consistent = layout::offsets(depth, burst).is_some_and(|o| {
            (o.pub_slots as u64, o.slots as u64, o.chunks as u64) == offs
                && slot_cnt == depth + burst
        });
        if !consistent {
            warn!(depth, burst, slot_cnt, "pool header inconsistent with its layout");
            return Err(ReasmError::BadMagic);
        }

        // SAFETY: offsets were checked against the pool shape.
        Ok(unsafe { Self::from_header(hdr) })
    }

    /// Detach from the pool, returning the memory it lives in.
    pub fn leave(self) -> NonNull<u8> {
        self.hdr.cast()
    }

    /// Invalidate the pool in `region` so later joins fail.
    pub fn delete(region: &mut Region) -> Result<(), ReasmError> {
        // SAFETY: the region is a live mapping and the exclusive borrow rules
        // out a joined handle.
        unsafe { Self::delete_raw(region.as_ptr()).map(|_| ()) }
    }

    /// Invalidate the pool at `shmem`, returning the memory.
    ///
    /// The memory itself is left to the caller.
    ///
    /// # Safety
    ///
    /// `shmem` must be null or point to at least a pool header's worth of
    /// mapped memory, and no handle may be joined to it.
    pub unsafe fn delete_raw(shmem: *mut u8) -> Result<NonNull<u8>, ReasmError> {
        let base = layout::check_base(shmem, REASM_ALIGN)?;
        // SAFETY: header is within the mapping.
        unsafe {
            (*base.cast::<Header>().as_ptr())
                .magic
                .store(0, Ordering::Release);
        }
        debug!(addr = base.as_ptr() as usize, "deleted reassembly pool");
        Ok(base)
    }

    /// # Safety
    ///
    /// `hdr` must point to an initialized header whose offsets lie within a
    /// mapping that outlives 'a.
    unsafe fn from_header(hdr: NonNull<Header>) -> Self {
        let h = hdr.as_ptr();
        let base = h as *mut u8;
        // SAFETY: offsets are inside the mapping per the caller contract, so
        // the derived pointers are non-null.
        unsafe {
            Self {
                hdr,
                pub_slots: NonNull::new_unchecked(base.add((*h).pub_slots_off as usize).cast()),
                slots: NonNull::new_unchecked(base.add((*h).slots_off as usize).cast()),
                chunks: NonNull::new_unchecked(base.add((*h).chunks_off as usize)),
                depth: (*h).depth,
                slot_cnt: (*h).slot_cnt,
                orig: (*h).orig,
                _region: PhantomData,
            }
        }
    }

    #[inline]
    fn magic(&self) -> &AtomicU64 {
        // SAFETY: the header outlives the handle.
        unsafe { &(*self.hdr.as_ptr()).magic }
    }

    #[inline]
    fn slots(&self) -> &[Slot] {
        // SAFETY: slot_cnt slots live at `slots` for 'a; only this handle writes them.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr(), self.slot_cnt as usize) }
    }

    #[inline]
    fn slots_mut(&mut self) -> &mut [Slot] {
        // SAFETY: as in `slots`, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.slots.as_ptr(), self.slot_cnt as usize) }
    }

    #[inline]
    fn pub_slots(&self) -> &[u32] {
        // SAFETY: depth entries live at `pub_slots` for 'a.
        unsafe { std::slice::from_raw_parts(self.pub_slots.as_ptr(), self.depth as usize) }
    }

    #[inline]
    fn pub_slots_mut(&mut self) -> &mut [u32] {
        // SAFETY: as in `pub_slots`, with exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.pub_slots.as_ptr(), self.depth as usize) }
    }

    #[inline]
    fn queue(&mut self) -> SlotQueue<'_> {
        let hdr = self.hdr.as_ptr();
        // SAFETY: the slot array and the head/tail fields are disjoint, and
        // no other reference to them exists while &mut self is held.
        unsafe {
            SlotQueue::new(
                std::slice::from_raw_parts_mut(self.slots.as_ptr(), self.slot_cnt as usize),
                &mut (*hdr).head,
                &mut (*hdr).tail,
            )
        }
    }

    /// `(head, tail)` of the free list.
    #[inline]
    pub(crate) fn list_ends(&self) -> (u32, u32) {
        let hdr = self.hdr.as_ptr();
        // SAFETY: plain reads of header fields only this handle writes.
        unsafe { ((*hdr).head, (*hdr).tail) }
    }

    #[inline]
    fn chunk_laddr(&self, idx: u32) -> *mut u8 {
        // SAFETY: idx < slot_cnt at every call site, so the chunk is in bounds.
        unsafe { self.chunks.as_ptr().add(idx as usize * CHUNK_STRIDE) }
    }

    /// Ring depth.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth as usize
    }

    /// Spare slots beyond the ring depth.
    #[inline]
    pub fn burst(&self) -> usize {
        (self.slot_cnt - self.depth) as usize
    }

    /// Total slots.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_cnt as usize
    }

    /// Origin id written into published entries.
    #[inline]
    pub fn orig(&self) -> u16 {
        self.orig
    }

    /// Bytes of memory the pool occupies.
    pub fn footprint(&self) -> usize {
        layout::footprint(self.depth as u64, self.burst() as u64).unwrap_or(usize::MAX)
    }

    /// Smallest chunk index a published entry can carry for data base `base`.
    pub fn chunk0(&self, base: *const u8) -> u64 {
        laddr_to_chunk(base, self.chunk_laddr(0))
    }

    /// Largest chunk index a published entry can carry for data base `base`.
    pub fn wmark(&self, base: *const u8) -> u64 {
        laddr_to_chunk(base, self.chunk_laddr(self.slot_cnt - 1))
    }

    /// Restore the initial distribution: slots `0..depth` published on lines
    /// `0..depth`, the rest free. In-progress messages are dropped and the
    /// published ones are forgotten.
    pub fn reset(&mut self) {
        let depth = self.depth;
        let cnt = self.slot_cnt;

        for (j, slot) in self.slots_mut().iter_mut().enumerate() {
            let j = j as u32;
            *slot = if j < depth {
                Slot::new(SlotState::Published)
            } else {
                let mut free = Slot::new(SlotState::Free);
                if j + 1 < cnt {
                    free.prev_idx = j + 1;
                }
                if j > depth {
                    free.next_idx = j - 1;
                }
                free
            };
        }
        for (line, owner) in self.pub_slots_mut().iter_mut().enumerate() {
            *owner = line as u32;
        }

        let hdr = self.hdr.as_ptr();
        // SAFETY: header fields only this handle writes.
        unsafe {
            (*hdr).head = cnt - 1;
            (*hdr).tail = depth;
        }

        debug!(depth, slot_cnt = cnt, "reset reassembly pool");
    }

    fn recover(&mut self, corruption: Corruption) {
        warn!(%corruption, "reassembly pool corruption detected, resetting");
        self.reset();
    }

    /// Start a new message, returning the slot to write it into.
    ///
    /// Takes the least recently touched slot from the free list. If every
    /// spare slot is Busy, the oldest in-progress message is abandoned and
    /// its slot reused. Never fails: a broken free list is repaired by
    /// [`reset`](Self::reset).
    pub fn prepare(&mut self, tsorig: u64) -> SlotId {
        loop {
            match self.try_prepare(tsorig) {
                Ok(id) => return id,
                Err(corruption) => self.recover(corruption),
            }
        }
    }

    /// Alias for [`prepare`](Self::prepare).
    #[inline]
    pub fn begin(&mut self, tsorig: u64) -> SlotId {
        self.prepare(tsorig)
    }

    fn try_prepare(&mut self, tsorig: u64) -> Result<SlotId, Corruption> {
        let idx = self
            .queue()
            .pop_tail()?
            .ok_or(Corruption::List { slot: SLOT_IDX_NONE })?;

        let slot = &mut self.slots_mut()[idx as usize];
        if !slot.state().is_some_and(SlotState::is_listed) {
            return Err(Corruption::SlotState { slot: idx });
        }
        if slot.is(SlotState::Busy) {
            trace!(
                slot = idx,
                conn_uid = slot.conn_uid,
                stream_id = slot.stream_id,
                "abandoning oldest in-progress message"
            );
        }
        slot.set_state(SlotState::Busy);
        slot.clear();
        slot.tsorig = tsorig as u32;

        self.queue().push_head(idx)?;
        Ok(SlotId(idx))
    }

    /// Append a fragment starting at byte `offset` of the message.
    ///
    /// - `offset == size`: bytes are appended.
    /// - `offset < size`: the already-held prefix of the fragment is skipped
    ///   and the rest appended; if nothing remains the call is a no-op
    ///   returning [`Appended::AlreadyCovered`].
    /// - `offset > size`: data was lost; the message is cancelled.
    /// - new size above [`MAX_MESSAGE_SIZE`]: the message is cancelled.
    pub fn append(&mut self, id: SlotId, data: &[u8], offset: usize) -> Result<Appended, AppendError> {
        let idx = id.0;
        let size = match self.slots().get(idx as usize) {
            Some(slot) if slot.is(SlotState::Busy) => slot.sz as usize,
            _ => return Err(AppendError::NotBusy),
        };

        if offset > size {
            trace!(slot = idx, offset, size, "fragment skips data, cancelling message");
            self.cancel(id);
            return Err(AppendError::Skipped { offset, size });
        }

        let data = if offset < size {
            let skip = size - offset;
            if skip >= data.len() {
                return Ok(Appended::AlreadyCovered);
            }
            &data[skip..]
        } else {
            data
        };

        let new_size = size.saturating_add(data.len());
        if new_size > MAX_MESSAGE_SIZE {
            trace!(slot = idx, size = new_size, "message too large, cancelling");
            self.cancel(id);
            return Err(AppendError::TooLarge { size: new_size });
        }

        // SAFETY: the chunk has CHUNK_STRIDE >= MAX_MESSAGE_SIZE bytes and
        // new_size <= MAX_MESSAGE_SIZE.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.chunk_laddr(idx).add(size), data.len());
        }
        self.slots_mut()[idx as usize].sz = new_size as u16;

        Ok(Appended::Extended { size: new_size })
    }

    /// Publish a completed message as sequence `seq` of `mcache`.
    ///
    /// The slot takes over ring line `seq % depth`; the slot that previously
    /// owned the line returns to the free list. `base` is the data base
    /// consumers translate chunk indices against and must not lie above the
    /// pool's chunks.
    ///
    /// If the index map is found inconsistent with the slot array, the pool
    /// is reset and [`PublishError::Corrupt`] returned; nothing is written to
    /// the ring.
    pub fn publish(
        &mut self,
        id: SlotId,
        mcache: &Mcache<'_>,
        base: *const u8,
        seq: u64,
        tspub: u64,
    ) -> Result<(), PublishError> {
        let idx = id.0;
        match self.slots().get(idx as usize) {
            Some(slot) if slot.is(SlotState::Busy) => {}
            _ => return Err(PublishError::NotBusy),
        }

        let depth = self.depth as usize;
        if mcache.depth() != depth {
            error!(pool = depth, ring = mcache.depth(), "ring depth does not match pool");
            return Err(PublishError::DepthMismatch {
                pool: depth,
                ring: mcache.depth(),
            });
        }

        let laddr = self.chunk_laddr(idx);
        let chunk = laddr_to_chunk(base, laddr);
        if (laddr as usize) < (base as usize) || chunk > u32::MAX as u64 {
            error!(
                base = base as usize,
                laddr = laddr as usize,
                slot = idx,
                "invalid data base for reassembly slot"
            );
            return Err(PublishError::ChunkOutOfRange {
                base: base as usize,
                laddr: laddr as usize,
            });
        }

        let line = line_idx(seq, depth);
        let victim = self.pub_slots()[line];
        let victim_state = match self.slots().get(victim as usize) {
            Some(slot) => slot.state,
            None => {
                let corruption = Corruption::OwnerOutOfBounds {
                    line,
                    slot: victim,
                    slot_cnt: self.slot_cnt,
                };
                self.recover(corruption);
                return Err(PublishError::Corrupt(corruption));
            }
        };
        if victim_state != SlotState::Published as u8 {
            let corruption = Corruption::OwnerNotPublished {
                line,
                slot: victim,
                state: victim_state,
            };
            self.recover(corruption);
            return Err(PublishError::Corrupt(corruption));
        }

        if let Err(corruption) = self.queue().remove(idx) {
            self.recover(corruption);
            return Err(PublishError::Corrupt(corruption));
        }
        self.slots_mut()[idx as usize].set_state(SlotState::Published);
        self.pub_slots_mut()[line] = idx;

        let freed = &mut self.slots_mut()[victim as usize];
        freed.set_state(SlotState::Free);
        freed.clear();
        if let Err(corruption) = self.queue().push_tail(victim) {
            self.recover(corruption);
            return Err(PublishError::Corrupt(corruption));
        }

        let slot = &self.slots()[idx as usize];
        mcache.publish(&Frag {
            seq,
            sig: 0,
            chunk: chunk as u32,
            sz: slot.sz,
            ctl: frag_ctl(self.orig, true, true, false),
            tsorig: slot.tsorig,
            tspub: tspub as u32,
        });

        Ok(())
    }

    /// Abandon an in-progress message, returning its slot to the free list
    /// as the next slot [`prepare`](Self::prepare) hands out.
    ///
    /// No-op unless the slot is Busy.
    pub fn cancel(&mut self, id: SlotId) {
        let idx = id.0;
        match self.slots().get(idx as usize) {
            Some(slot) if slot.is(SlotState::Busy) => {}
            _ => return,
        }

        if let Err(corruption) = self.queue().remove(idx) {
            self.recover(corruption);
            return;
        }
        let slot = &mut self.slots_mut()[idx as usize];
        slot.set_state(SlotState::Free);
        slot.clear();
        if let Err(corruption) = self.queue().push_tail(idx) {
            self.recover(corruption);
        }
    }

    /// Record the transport stream an in-progress message belongs to.
    ///
    /// Returns `false` if the slot is not Busy.
    pub fn set_owner(&mut self, id: SlotId, conn_uid: u64, stream_id: u64) -> bool {
        match self.slots_mut().get_mut(id.0 as usize) {
            Some(slot) if slot.is(SlotState::Busy) => {
                slot.conn_uid = conn_uid;
                slot.stream_id = stream_id;
                true
            }
            _ => false,
        }
    }

    /// Find the in-progress message of a stream.
    ///
    /// Walks the free list, so the cost is bounded by `burst`.
    pub fn query(&self, conn_uid: u64, stream_id: u64) -> Option<SlotId> {
        let slots = self.slots();
        let (mut idx, _) = self.list_ends();
        for _ in 0..self.slot_cnt {
            let slot = slots.get(idx as usize)?;
            if slot.is(SlotState::Busy) && slot.conn_uid == conn_uid && slot.stream_id == stream_id
            {
                return Some(SlotId(idx));
            }
            idx = slot.next_idx;
        }
        None
    }

    /// Snapshot of a slot's metadata. `None` if out of range or corrupt.
    pub fn slot_info(&self, id: SlotId) -> Option<SlotInfo> {
        let slot = self.slots().get(id.0 as usize)?;
        Some(SlotInfo {
            state: slot.state()?,
            size: slot.sz as usize,
            tsorig: slot.tsorig,
            conn_uid: slot.conn_uid,
            stream_id: slot.stream_id,
        })
    }

    /// Bytes reassembled so far in a Busy slot, or the payload of a
    /// Published one.
    pub fn data(&self, id: SlotId) -> Option<&[u8]> {
        let slot = self.slots().get(id.0 as usize)?;
        if slot.is(SlotState::Free) || slot.state().is_none() {
            return None;
        }
        // SAFETY: the chunk is in bounds and only written through &mut self.
        Some(unsafe { std::slice::from_raw_parts(self.chunk_laddr(id.0), slot.sz as usize) })
    }

    /// Slot currently owning ring line `line`.
    pub fn line_owner(&self, line: usize) -> Option<SlotId> {
        self.pub_slots().get(line).map(|&idx| SlotId(idx))
    }

    /// Overwrite the owner recorded for ring line `line`.
    #[cfg(test)]
    fn corrupt_line_owner(&mut self, line: usize, owner: u32) {
        if let Some(entry) = self.pub_slots_mut().get_mut(line) {
            *entry = owner;
        }
    }

    /// Count slots by state.
    pub fn metrics(&self) -> PoolMetrics {
        let mut metrics = PoolMetrics {
            depth: self.depth,
            burst: self.slot_cnt - self.depth,
            slot_count: self.slot_cnt,
            ..Default::default()
        };
        for slot in self.slots() {
            match slot.state() {
                Some(SlotState::Free) => metrics.free += 1,
                Some(SlotState::Busy) => {
                    metrics.busy += 1;
                    metrics.busy_bytes += slot.sz as u64;
                }
                Some(SlotState::Published) => metrics.published += 1,
                None => metrics.corrupt += 1,
            }
        }
        metrics
    }

    /// Check every bookkeeping invariant.
    ///
    /// Exactly `depth` slots are Published, each owning one distinct ring
    /// line; every other slot is Free or Busy and linked exactly once on a
    /// well-formed free list. Allocates; not for the hot path.
    pub fn verify(&self) -> Result<(), Corruption> {
        let slots = self.slots();

        let mut listed = 0u32;
        let mut published = 0u32;
        for (idx, slot) in slots.iter().enumerate() {
            match slot.state() {
                Some(SlotState::Published) => published += 1,
                Some(_) => listed += 1,
                None => return Err(Corruption::SlotState { slot: idx as u32 }),
            }
        }
        if published != self.depth {
            return Err(Corruption::Count {
                published,
                depth: self.depth,
            });
        }

        let (head, tail) = self.list_ends();
        let mut prev = SLOT_IDX_NONE;
        let mut idx = head;
        let mut walked = 0u32;
        while idx != SLOT_IDX_NONE {
            let slot = slots.get(idx as usize).ok_or(Corruption::List { slot: idx })?;
            if walked == listed
                || slot.prev_idx != prev
                || !slot.state().is_some_and(SlotState::is_listed)
            {
                return Err(Corruption::List { slot: idx });
            }
            walked += 1;
            prev = idx;
            idx = slot.next_idx;
        }
        if walked != listed || tail != prev {
            return Err(Corruption::List { slot: tail });
        }

        let mut owned = vec![false; slots.len()];
        for (line, &owner) in self.pub_slots().iter().enumerate() {
            let slot = slots.get(owner as usize).ok_or(Corruption::OwnerOutOfBounds {
                line,
                slot: owner,
                slot_cnt: self.slot_cnt,
            })?;
            if !slot.is(SlotState::Published) {
                return Err(Corruption::OwnerNotPublished {
                    line,
                    slot: owner,
                    state: slot.state,
                });
            }
            if std::mem::replace(&mut owned[owner as usize], true) {
                return Err(Corruption::DuplicateOwner { slot: owner });
            }
        }

        Ok(())
    }
}

/// Builder that maps a region and lays out a pool in it.
///
/// # Example
///
/// ```
/// use reasm::{Reasm, ReasmBuilder};
///
/// let mut region = ReasmBuilder::new(64).burst(8).origin(1).build()?;
/// let reasm = Reasm::join(&mut region)?;
/// assert_eq!(reasm.slot_count(), 72);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct ReasmBuilder {
    depth: u64,
    burst: u64,
    orig: u64,
    hugepage_size: HugepageSize,
}

impl ReasmBuilder {
    /// A builder for a pool feeding a ring of `depth` lines.
    pub fn new(depth: u64) -> Self {
        Self {
            depth,
            burst: 16,
            orig: 0,
            hugepage_size: HugepageSize::None,
        }
    }

    /// Spare slots beyond the ring depth (default: 16, minimum 2).
    pub fn burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Origin id written into published entries (default: 0).
    pub fn origin(mut self, orig: u64) -> Self {
        self.orig = orig;
        self
    }

    /// Hugepage preference for the mapping (default: none).
    pub fn hugepage_size(mut self, size: HugepageSize) -> Self {
        self.hugepage_size = size;
        self
    }

    /// Map a region and create the pool in it.
    pub fn build(self) -> Result<Region, std::io::Error> {
        let invalid = |e: ReasmError| std::io::Error::new(std::io::ErrorKind::InvalidInput, e);

        layout::validate(self.depth, self.burst).map_err(invalid)?;
        let footprint = layout::footprint(self.depth, self.burst)
            .ok_or_else(|| invalid(ReasmError::InvalidDepth(self.depth)))?;

        let mut region = allocate(footprint, self.hugepage_size)?;
        Reasm::new(&mut region, self.depth, self.burst, self.orig).map_err(invalid)?;
        Ok(region)
    }
}
