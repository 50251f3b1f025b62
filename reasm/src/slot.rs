//! Slot state machine and per-slot metadata.
//!
//! # State Transition Diagram
//!
//! ```text
//!            prepare()               publish()
//!   +------+ ---------> +------+ -------------> +-----------+
//!   | Free |            | Busy |                | Published |
//!   +------+ <--------- +------+                +-----------+
//!      ^      cancel()     |  ^                       |
//!      |   append() abort  |  | prepare() evicts an   |
//!      +-------------------+  | abandoned Busy slot   |
//!      |                      +--+                    |
//!      +----------------------------------------------+
//!         evicted when a later publish reuses its ring line
//! ```
//!
//! Free and Busy slots are threaded on the free list; Published slots are
//! reachable only through the index map.

/// Sentinel for "no slot" in list links.
pub const SLOT_IDX_NONE: u32 = u32::MAX;

/// Lifecycle state of a slot.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// On the free list, holds no message.
    Free = 0,
    /// On the free list, message being reassembled.
    Busy = 1,
    /// Owns a ring line; data may be read by consumers.
    Published = 2,
}

impl SlotState {
    /// Decode a raw state byte. Returns `None` for corrupt values.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SlotState::Free),
            1 => Some(SlotState::Busy),
            2 => Some(SlotState::Published),
            _ => None,
        }
    }

    /// Whether slots in this state are linked on the free list.
    #[inline]
    pub fn is_listed(self) -> bool {
        matches!(self, SlotState::Free | SlotState::Busy)
    }
}

/// Slot metadata record, stored in the pool's slot array.
///
/// The state is kept as a raw byte since the region may be shared with other
/// processes and must never be trusted to hold a valid discriminant.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub conn_uid: u64,
    pub stream_id: u64,
    pub prev_idx: u32,
    pub next_idx: u32,
    pub tsorig: u32,
    pub sz: u16,
    pub state: u8,
    pub _pad: u8,
}

impl Slot {
    /// A cleared, unlinked slot in the given state.
    pub const fn new(state: SlotState) -> Self {
        Self {
            conn_uid: 0,
            stream_id: 0,
            prev_idx: SLOT_IDX_NONE,
            next_idx: SLOT_IDX_NONE,
            tsorig: 0,
            sz: 0,
            state: state as u8,
            _pad: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u8(self.state)
    }

    #[inline]
    pub fn is(&self, state: SlotState) -> bool {
        self.state == state as u8
    }

    #[inline]
    pub fn set_state(&mut self, state: SlotState) {
        self.state = state as u8;
    }

    /// Drop message contents and correlation fields.
    #[inline]
    pub fn clear(&mut self) {
        self.sz = 0;
        self.conn_uid = 0;
        self.stream_id = 0;
    }
}

/// Handle to a slot, returned by [`Reasm::prepare`](crate::Reasm::prepare).
///
/// A handle stays numerically valid after the slot is published, cancelled,
/// or recycled; operations on such a stale handle report `NotBusy` or, if
/// the slot has since been reused, act on the new message. Callers that keep
/// handles across `prepare` calls should check ownership with
/// [`Reasm::slot_info`](crate::Reasm::slot_info) or
/// [`Reasm::query`](crate::Reasm::query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub(crate) u32);

impl SlotId {
    /// Index of the slot in the slot and chunk arrays.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Snapshot of one slot's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Current state.
    pub state: SlotState,
    /// Bytes reassembled so far.
    pub size: usize,
    /// Origin timestamp recorded by `prepare`.
    pub tsorig: u32,
    /// Connection correlation id (0 if unset).
    pub conn_uid: u64,
    /// Stream correlation id (0 if unset).
    pub stream_id: u64,
}
