//! Memory layout of a reassembly pool.
//!
//! A pool is one contiguous region laid out as:
//!
//! ```text
//! +------------------------------+  offset 0, REASM_ALIGN
//! | Header                       |
//! +------------------------------+  align 4
//! | index map   [u32; depth]     |
//! +------------------------------+  align 8
//! | slots       [Slot; slot_cnt] |
//! +------------------------------+  CHUNK_ALIGN
//! | chunks      [[u8; CHUNK_STRIDE]; slot_cnt]
//! +------------------------------+  REASM_ALIGN
//! ```
//!
//! Every sub-region is addressed by an offset from the header, never by a
//! pointer, so the region can be mapped at different addresses in different
//! processes.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use crate::error::ReasmError;
use crate::slot::Slot;

/// Largest message the pool reassembles, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1232;

/// log2 of the chunk addressing granule.
pub const CHUNK_LG_SZ: u32 = 6;

/// Alignment of every chunk, and the unit of chunk addressing.
pub const CHUNK_ALIGN: usize = 1 << CHUNK_LG_SZ;

/// Distance between consecutive chunks in the chunk array.
pub const CHUNK_STRIDE: usize = align_up(MAX_MESSAGE_SIZE, CHUNK_ALIGN);

/// Required alignment of the memory handed to construction.
pub const REASM_ALIGN: usize = 64;

/// Largest accepted ring depth.
pub const DEPTH_MAX: u64 = 0x7fff_ffff;

/// Largest accepted burst.
pub const BURST_MAX: u64 = 0x7fff_ffff;

/// Largest origin id that fits the ring entry control field.
pub const ORIGIN_MAX: u64 = (1 << 13) - 1;

/// Magic marking a live pool ("REASMPL" + layout version 1).
pub(crate) const REASM_MAGIC: u64 = 0x5245_4153_4d50_4c01;

/// Pool header. Lives at offset 0 of the region.
#[repr(C, align(64))]
pub(crate) struct Header {
    /// Liveness marker. Written last on construction, cleared first on delete.
    pub magic: AtomicU64,
    pub pub_slots_off: u64,
    pub slots_off: u64,
    pub chunks_off: u64,
    pub depth: u32,
    pub burst: u32,
    pub slot_cnt: u32,
    /// Most recently touched list entry.
    pub head: u32,
    /// Least recently touched list entry; next `prepare` victim.
    pub tail: u32,
    pub orig: u16,
    pub _pad: u16,
}

/// Byte offsets of each sub-region, relative to the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Offsets {
    pub pub_slots: usize,
    pub slots: usize,
    pub chunks: usize,
    pub footprint: usize,
}

/// Round `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[inline]
fn checked_align_up(size: usize, align: usize) -> Option<usize> {
    Some(size.checked_add(align - 1)? & !(align - 1))
}

/// Check that caller memory is non-null and aligned to `align`.
pub(crate) fn check_base(shmem: *mut u8, align: usize) -> Result<NonNull<u8>, ReasmError> {
    let base = NonNull::new(shmem).ok_or(ReasmError::NullMemory)?;
    let addr = base.as_ptr() as usize;
    if addr % align != 0 {
        return Err(ReasmError::Misaligned { addr, align });
    }
    Ok(base)
}

/// Check the pool shape parameters.
pub(crate) fn validate(depth: u64, burst: u64) -> Result<(), ReasmError> {
    if !depth.is_power_of_two() || depth > DEPTH_MAX {
        return Err(ReasmError::InvalidDepth(depth));
    }
    if !(2..=BURST_MAX).contains(&burst) {
        return Err(ReasmError::InvalidBurst(burst));
    }
    Ok(())
}

/// Compute sub-region offsets for a pool of the given shape.
pub(crate) fn offsets(depth: u64, burst: u64) -> Option<Offsets> {
    validate(depth, burst).ok()?;

    let depth = usize::try_from(depth).ok()?;
    let slot_cnt = depth.checked_add(usize::try_from(burst).ok()?)?;

    let pub_slots = checked_align_up(size_of::<Header>(), align_of::<u32>())?;
    let slots = checked_align_up(
        pub_slots.checked_add(depth.checked_mul(size_of::<u32>())?)?,
        align_of::<Slot>(),
    )?;
    let chunks = checked_align_up(
        slots.checked_add(slot_cnt.checked_mul(size_of::<Slot>())?)?,
        CHUNK_ALIGN,
    )?;
    let footprint = checked_align_up(
        chunks.checked_add(slot_cnt.checked_mul(CHUNK_STRIDE)?)?,
        REASM_ALIGN,
    )?;

    Some(Offsets {
        pub_slots,
        slots,
        chunks,
        footprint,
    })
}

/// Bytes of memory needed for a pool of the given shape.
///
/// Returns `None` if `depth` is not a power of two, `burst < 2`, either
/// exceeds its maximum, or the footprint overflows.
pub fn footprint(depth: u64, burst: u64) -> Option<usize> {
    offsets(depth, burst).map(|o| o.footprint)
}

/// Required alignment of pool memory.
#[inline]
pub const fn align() -> usize {
    REASM_ALIGN
}

/// Translate a local address into a chunk index relative to `base`.
///
/// `laddr` must not be below `base`; callers check this.
#[inline]
pub fn laddr_to_chunk(base: *const u8, laddr: *const u8) -> u64 {
    ((laddr as usize).wrapping_sub(base as usize) >> CHUNK_LG_SZ) as u64
}

/// Translate a chunk index relative to `base` back into a local address.
#[inline]
pub fn chunk_to_laddr(base: *const u8, chunk: u32) -> *const u8 {
    base.wrapping_add((chunk as usize) << CHUNK_LG_SZ)
}
