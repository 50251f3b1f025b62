//! Error types for pool lifecycle and writer operations.

/// Configuration and lifecycle errors.
///
/// These indicate that the pool and its caller were not set up consistently
/// and are not expected to occur mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReasmError {
    /// The memory pointer handed in was null.
    #[error("null memory region")]
    NullMemory,

    /// The memory region does not satisfy the pool alignment.
    #[error("memory region {addr:#x} is not aligned to {align} bytes")]
    Misaligned {
        /// Address of the region.
        addr: usize,
        /// Required alignment.
        align: usize,
    },

    /// The memory region cannot hold a pool of the requested shape.
    #[error("memory region of {have} bytes is smaller than the {need} byte footprint")]
    RegionTooSmall {
        /// Bytes available.
        have: usize,
        /// Bytes required.
        need: usize,
    },

    /// Ring depth is zero, not a power of two, or too large.
    #[error("invalid depth {0} (must be a power of two <= 0x7fffffff)")]
    InvalidDepth(u64),

    /// Burst is too small or too large.
    #[error("invalid burst {0} (must be in 2..=0x7fffffff)")]
    InvalidBurst(u64),

    /// Origin id does not fit in the ring entry control field.
    #[error("invalid origin {0} (max 8191)")]
    InvalidOrigin(u64),

    /// The region does not hold a live pool.
    #[error("bad magic")]
    BadMagic,
}

/// Outcome of a successful [`Reasm::append`](crate::Reasm::append).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Bytes were appended; `size` is the new message size.
    Extended {
        /// Message size after the append.
        size: usize,
    },
    /// Every byte of the fragment was already present. Nothing changed.
    AlreadyCovered,
}

/// Failed [`Reasm::append`](crate::Reasm::append).
///
/// `Skipped` and `TooLarge` abort the in-progress message: the slot has
/// already been returned to the free list when the error is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// The slot is not being written. Indicates a stale or invalid handle.
    #[error("slot is not busy")]
    NotBusy,

    /// The fragment starts past the end of the received data.
    #[error("fragment at offset {offset} skips data (have {size} bytes)")]
    Skipped {
        /// Declared fragment offset.
        offset: usize,
        /// Bytes held before the fragment.
        size: usize,
    },

    /// The message would exceed the maximum message size.
    #[error("message of {size} bytes exceeds maximum")]
    TooLarge {
        /// Size the message would have reached.
        size: usize,
    },
}

/// Failed [`Reasm::publish`](crate::Reasm::publish).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// The slot is not being written. Indicates a stale or invalid handle.
    #[error("slot is not busy")]
    NotBusy,

    /// The index map and slot array disagreed. The pool has been reset.
    #[error("index map corruption: {0}")]
    Corrupt(Corruption),

    /// The ring does not have the pool's depth.
    #[error("ring depth {ring} does not match pool depth {pool}")]
    DepthMismatch {
        /// Pool depth.
        pool: usize,
        /// Ring depth.
        ring: usize,
    },

    /// The slot's chunk cannot be addressed from the given base. The pool and
    /// ring were not set up consistently.
    #[error("chunk address {laddr:#x} not addressable from base {base:#x}")]
    ChunkOutOfRange {
        /// Ring data base address.
        base: usize,
        /// Address of the slot's chunk.
        laddr: usize,
    },
}

/// Internal consistency violations found in the pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Corruption {
    /// A ring line records an owner outside the slot array.
    #[error("line {line} owner {slot} out of bounds (slot count {slot_cnt})")]
    OwnerOutOfBounds {
        /// Ring line.
        line: usize,
        /// Recorded owner.
        slot: u32,
        /// Number of slots.
        slot_cnt: u32,
    },

    /// A ring line's owner is not in the published state.
    #[error("line {line} owner {slot} has state {state}, not published")]
    OwnerNotPublished {
        /// Ring line.
        line: usize,
        /// Recorded owner.
        slot: u32,
        /// Raw state byte found.
        state: u8,
    },

    /// Two ring lines record the same owner.
    #[error("slot {slot} owns more than one line")]
    DuplicateOwner {
        /// Slot index.
        slot: u32,
    },

    /// The free list is malformed.
    #[error("free list broken at slot {slot}")]
    List {
        /// Slot at which the walk failed.
        slot: u32,
    },

    /// A slot has an undecodable state or is linked inconsistently with it.
    #[error("slot {slot} has inconsistent state")]
    SlotState {
        /// Slot index.
        slot: u32,
    },

    /// State counts do not add up.
    #[error("{published} published slots, expected {depth}")]
    Count {
        /// Published slots found.
        published: u32,
        /// Ring depth.
        depth: u32,
    },
}
