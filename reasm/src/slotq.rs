//! Index-linked free list over the slot array.
//!
//! Free and Busy slots are threaded on one doubly linked list ordered from
//! most recently touched (head) to least recently touched (tail). Links are
//! slot indices, so the list survives the region being mapped elsewhere.
//!
//! ```text
//! head                                                tail
//!  [busy] -next-> [busy] -next-> [free] -next-> [free]
//!         <-prev-        <-prev-        <-prev-
//! ```
//!
//! All operations are O(1) and touch only the affected node, its two
//! neighbours, and the head/tail indices. Links come from shared memory, so
//! every index is bounds checked and a broken list is reported rather than
//! followed.

use crate::error::Corruption;
use crate::slot::{SLOT_IDX_NONE, Slot};

/// Borrowed view of the list: the slot array plus the head/tail indices.
pub(crate) struct SlotQueue<'a> {
    slots: &'a mut [Slot],
    head: &'a mut u32,
    tail: &'a mut u32,
}

impl<'a> SlotQueue<'a> {
    pub fn new(slots: &'a mut [Slot], head: &'a mut u32, tail: &'a mut u32) -> Self {
        Self { slots, head, tail }
    }

    #[inline]
    fn check(&self, idx: u32) -> Result<usize, Corruption> {
        if (idx as usize) < self.slots.len() {
            Ok(idx as usize)
        } else {
            Err(Corruption::List { slot: idx })
        }
    }

    /// Insert `idx` as the most recently touched entry.
    pub fn push_head(&mut self, idx: u32) -> Result<(), Corruption> {
        let i = self.check(idx)?;
        let old = *self.head;
        if old != SLOT_IDX_NONE {
            let o = self.check(old)?;
            self.slots[o].prev_idx = idx;
        } else {
            *self.tail = idx;
        }
        self.slots[i].prev_idx = SLOT_IDX_NONE;
        self.slots[i].next_idx = old;
        *self.head = idx;
        Ok(())
    }

    /// Insert `idx` as the least recently touched entry, making it the next
    /// one returned by [`pop_tail`](Self::pop_tail).
    pub fn push_tail(&mut self, idx: u32) -> Result<(), Corruption> {
        let i = self.check(idx)?;
        let old = *self.tail;
        if old != SLOT_IDX_NONE {
            let o = self.check(old)?;
            self.slots[o].next_idx = idx;
        } else {
            *self.head = idx;
        }
        self.slots[i].next_idx = SLOT_IDX_NONE;
        self.slots[i].prev_idx = old;
        *self.tail = idx;
        Ok(())
    }

    /// Remove and return the least recently touched entry.
    pub fn pop_tail(&mut self) -> Result<Option<u32>, Corruption> {
        let idx = *self.tail;
        if idx == SLOT_IDX_NONE {
            return Ok(None);
        }
        let i = self.check(idx)?;
        let prev = self.slots[i].prev_idx;
        if prev != SLOT_IDX_NONE {
            let p = self.check(prev)?;
            self.slots[p].next_idx = SLOT_IDX_NONE;
        } else {
            *self.head = SLOT_IDX_NONE;
        }
        *self.tail = prev;
        self.slots[i].prev_idx = SLOT_IDX_NONE;
        self.slots[i].next_idx = SLOT_IDX_NONE;
        Ok(Some(idx))
    }

    /// Unlink `idx` from anywhere in the list.
    pub fn remove(&mut self, idx: u32) -> Result<(), Corruption> {
        let i = self.check(idx)?;
        let prev = self.slots[i].prev_idx;
        let next = self.slots[i].next_idx;

        // Validate everything before writing so a bad link leaves the list as it was.
        let p = match prev {
            SLOT_IDX_NONE if *self.head != idx => return Err(Corruption::List { slot: idx }),
            SLOT_IDX_NONE => None,
            prev => Some(self.check(prev)?),
        };
        let n = match next {
            SLOT_IDX_NONE if *self.tail != idx => return Err(Corruption::List { slot: idx }),
            SLOT_IDX_NONE => None,
            next => Some(self.check(next)?),
        };

        match p {
            Some(p) => self.slots[p].next_idx = next,
            None => *self.head = next,
        }
        match n {
            Some(n) => self.slots[n].prev_idx = prev,
            None => *self.tail = prev,
        }
        self.slots[i].prev_idx = SLOT_IDX_NONE;
        self.slots[i].next_idx = SLOT_IDX_NONE;
        Ok(())
    }
}
