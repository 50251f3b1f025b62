//! Downstream publish ring ("mcache").
//!
//! The ring is a fixed array of `depth` [`FragMeta`] lines. Sequence number
//! `seq` lives on line `seq & (depth - 1)`. A single writer publishes with a
//! two-phase sequence protocol; any number of readers on other cores poll it
//! without locks and detect overwrites by re-checking the sequence.
//!
//! # Publish Protocol
//!
//! ```text
//! writer                              reader
//! ------                              ------
//! seq    <- seq - 1   (in progress)   s0 <- seq           (acquire)
//! fence(release)                      chunk, sz, ctl, ...  (relaxed)
//! chunk, sz, ctl, ... (relaxed)       fence(acquire)
//! fence(release)                      s1 <- seq
//! seq    <- seq       (committed)     s0 == s1 == expected => consistent
//! ```
//!
//! A reader that observes the committed sequence is guaranteed to observe
//! every field and chunk byte written before it.

use std::mem::size_of;
use std::ptr::{self, NonNull};

use tracing::{debug, warn};

use crate::error::ReasmError;
use crate::layout::{DEPTH_MAX, check_base, chunk_to_laddr};
use crate::region::Region;
use crate::sync::{AtomicU16, AtomicU32, AtomicU64, Ordering, compiler_fence, fence};

/// Start-of-message control bit.
pub const CTL_SOM: u16 = 1 << 0;
/// End-of-message control bit.
pub const CTL_EOM: u16 = 1 << 1;
/// Error / fragmentation control bit.
pub const CTL_ERR: u16 = 1 << 2;
/// Bit offset of the origin id within the control field.
pub const CTL_ORIG_SHIFT: u32 = 3;

/// Pack a ring entry control field.
#[inline]
pub const fn frag_ctl(orig: u16, som: bool, eom: bool, err: bool) -> u16 {
    (orig << CTL_ORIG_SHIFT) | (som as u16) | ((eom as u16) << 1) | ((err as u16) << 2)
}

/// Origin id encoded in a control field.
#[inline]
pub const fn ctl_orig(ctl: u16) -> u16 {
    ctl >> CTL_ORIG_SHIFT
}

/// `seq` moved back by `n`, wrapping.
#[inline]
pub const fn seq_dec(seq: u64, n: u64) -> u64 {
    seq.wrapping_sub(n)
}

/// `seq` moved forward by `n`, wrapping.
#[inline]
pub const fn seq_inc(seq: u64, n: u64) -> u64 {
    seq.wrapping_add(n)
}

/// Signed distance from `b` to `a`, robust to wrap-around.
#[inline]
pub const fn seq_diff(a: u64, b: u64) -> i64 {
    a.wrapping_sub(b) as i64
}

/// Ring line holding `seq` in a ring of `depth` lines (a power of two).
#[inline]
pub const fn line_idx(seq: u64, depth: usize) -> usize {
    (seq & (depth as u64 - 1)) as usize
}

/// Plain copy of one ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frag {
    /// Sequence number.
    pub seq: u64,
    /// Application signature; zero for reassembled messages.
    pub sig: u64,
    /// Chunk index of the payload relative to the data base.
    pub chunk: u32,
    /// Payload size in bytes.
    pub sz: u16,
    /// Control bits, see [`frag_ctl`].
    pub ctl: u16,
    /// Origin timestamp (compressed).
    pub tsorig: u32,
    /// Publish timestamp (compressed).
    pub tspub: u32,
}

impl Frag {
    /// Local address of the payload given the data base the chunk was
    /// computed against.
    #[inline]
    pub fn laddr(&self, base: *const u8) -> *const u8 {
        chunk_to_laddr(base, self.chunk)
    }
}

/// One ring line. Layout is fixed at 32 bytes and shared with readers that
/// may live in other processes.
#[repr(C, align(32))]
pub struct FragMeta {
    seq: AtomicU64,
    sig: AtomicU64,
    chunk: AtomicU32,
    sz: AtomicU16,
    ctl: AtomicU16,
    tsorig: AtomicU32,
    tspub: AtomicU32,
}

/// Result of polling a ring line for an expected sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    /// The entry for the expected sequence, read consistently.
    Ready(Frag),
    /// The writer has not reached the expected sequence yet.
    NotReady,
    /// The line already holds a later sequence; the reader fell behind.
    Overrun {
        /// Sequence found on the line.
        seq: u64,
    },
}

impl FragMeta {
    /// A line that reads as holding `seq`.
    pub fn new(seq: u64) -> Self {
        Self {
            seq: AtomicU64::new(seq),
            sig: AtomicU64::new(0),
            chunk: AtomicU32::new(0),
            sz: AtomicU16::new(0),
            ctl: AtomicU16::new(frag_ctl(0, true, true, true)),
            tsorig: AtomicU32::new(0),
            tspub: AtomicU32::new(0),
        }
    }

    /// Current sequence, with acquire ordering.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Write `frag` using the two-phase sequence protocol.
    ///
    /// Must only be called by the ring's single writer.
    #[inline]
    pub fn publish(&self, frag: &Frag) {
        self.seq.store(seq_dec(frag.seq, 1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.sig.store(frag.sig, Ordering::Relaxed);
        self.chunk.store(frag.chunk, Ordering::Relaxed);
        self.sz.store(frag.sz, Ordering::Relaxed);
        self.ctl.store(frag.ctl, Ordering::Relaxed);
        self.tsorig.store(frag.tsorig, Ordering::Relaxed);
        self.tspub.store(frag.tspub, Ordering::Relaxed);
        fence(Ordering::Release);
        self.seq.store(frag.seq, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Read the line expecting sequence `seq`.
    pub fn poll(&self, seq: u64) -> Poll {
        let seq0 = self.seq.load(Ordering::Acquire);
        let diff = seq_diff(seq0, seq);
        if diff < 0 {
            return Poll::NotReady;
        }
        if diff > 0 {
            return Poll::Overrun { seq: seq0 };
        }

        let frag = Frag {
            seq,
            sig: self.sig.load(Ordering::Relaxed),
            chunk: self.chunk.load(Ordering::Relaxed),
            sz: self.sz.load(Ordering::Relaxed),
            ctl: self.ctl.load(Ordering::Relaxed),
            tsorig: self.tsorig.load(Ordering::Relaxed),
            tspub: self.tspub.load(Ordering::Relaxed),
        };

        fence(Ordering::Acquire);
        let seq1 = self.seq.load(Ordering::Relaxed);
        if seq1 != seq0 {
            return Poll::Overrun { seq: seq1 };
        }
        Poll::Ready(frag)
    }

    /// Whether the line still holds `seq`. Call after copying a payload to
    /// confirm it was not overwritten during the copy.
    #[inline]
    pub fn holds(&self, seq: u64) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) == seq
    }
}

/// Required alignment of memory handed to [`Mcache::new_raw`].
pub const MCACHE_ALIGN: usize = 64;

/// Magic marking a live ring ("MCACHE" + layout version 1).
const MCACHE_MAGIC: u64 = 0x4d43_4143_4845_0001;

/// Ring header. The lines follow it directly.
#[repr(C, align(64))]
struct McacheHeader {
    /// Liveness marker. Written last on construction, cleared first on delete.
    magic: AtomicU64,
    depth: u64,
    seq0: u64,
}

enum Lines<'a> {
    Heap(Box<[FragMeta]>),
    Mapped(&'a [FragMeta]),
}

fn check_depth(depth: u64) -> Result<(), ReasmError> {
    if !depth.is_power_of_two() || depth > DEPTH_MAX {
        return Err(ReasmError::InvalidDepth(depth));
    }
    Ok(())
}

/// Sequence line `line` holds in a fresh ring: the one of the `depth`
/// sequences before `seq0` that maps to it.
#[inline]
fn initial_seq(seq0: u64, depth: usize, line: usize) -> u64 {
    let back = line_idx(seq0.wrapping_sub(line as u64), depth) as u64;
    seq_dec(seq0, if back == 0 { depth as u64 } else { back })
}

/// A ring of `depth` lines.
///
/// The lines live either on the heap ([`Mcache::new`]) or in caller-owned
/// memory laid out as a header followed by the lines ([`Mcache::new_in`],
/// [`Mcache::new_raw`]), which readers in other threads or processes attach
/// to with [`Mcache::join`] or [`Mcache::join_raw`].
///
/// ```text
/// +-----------------+  offset 0, MCACHE_ALIGN
/// | magic depth seq0|
/// +-----------------+  offset 64
/// | FragMeta[depth] |
/// +-----------------+
/// ```
pub struct Mcache<'a> {
    lines: Lines<'a>,
    seq0: u64,
}

impl Mcache<'static> {
    /// Create a heap ring whose first published sequence will be `seq0`.
    ///
    /// Every line initially holds a sequence below `seq0`, so readers
    /// starting at `seq0` see [`Poll::NotReady`] until the writer arrives.
    pub fn new(depth: usize, seq0: u64) -> Result<Self, ReasmError> {
        check_depth(depth as u64)?;
        let lines: Vec<FragMeta> = (0..depth)
            .map(|line| FragMeta::new(initial_seq(seq0, depth, line)))
            .collect();
        Ok(Self {
            lines: Lines::Heap(lines.into_boxed_slice()),
            seq0,
        })
    }
}

impl<'a> Mcache<'a> {
    /// Bytes of memory needed for a ring of `depth` lines.
    ///
    /// Returns `None` if `depth` is not a power of two or exceeds
    /// [`DEPTH_MAX`].
    pub fn footprint(depth: u64) -> Option<usize> {
        check_depth(depth).ok()?;
        let lines = usize::try_from(depth)
            .ok()?
            .checked_mul(size_of::<FragMeta>())?;
        let size = size_of::<McacheHeader>().checked_add(lines)?;
        Some(size.checked_add(MCACHE_ALIGN - 1)? & !(MCACHE_ALIGN - 1))
    }

    /// Required alignment of ring memory.
    #[inline]
    pub const fn align() -> usize {
        MCACHE_ALIGN
    }

    /// Lay out a new ring in `region`.
    pub fn new_in(region: &'a mut Region, depth: u64, seq0: u64) -> Result<Self, ReasmError> {
        // SAFETY: the region is a live mapping of `len()` bytes, exclusively
        // borrowed for 'a.
        unsafe { Self::new_raw(region.as_ptr(), region.len(), depth, seq0) }
    }

    /// Lay out a new ring at `shmem`, with the same initial sequences as
    /// [`Mcache::new`].
    ///
    /// # Safety
    ///
    /// `shmem` must be null or valid for reads and writes of `shmem_sz` bytes
    /// for 'a, and no other handle may be joined to it during the call.
    pub unsafe fn new_raw(
        shmem: *mut u8,
        shmem_sz: usize,
        depth: u64,
        seq0: u64,
    ) -> Result<Self, ReasmError> {
        let base = check_base(shmem, MCACHE_ALIGN)?;
        check_depth(depth)?;
        let need = Self::footprint(depth).ok_or(ReasmError::InvalidDepth(depth))?;
        if shmem_sz < need {
            return Err(ReasmError::RegionTooSmall {
                have: shmem_sz,
                need,
            });
        }

        let hdr = base.cast::<McacheHeader>().as_ptr();
        let depth_usize = depth as usize;
        // SAFETY: the memory is aligned and covers the footprint. The magic
        // is cleared before any other write and set only once every line is
        // initialized.
        unsafe {
            (*hdr).magic.store(0, Ordering::Release);
            (*hdr).depth = depth;
            (*hdr).seq0 = seq0;
            let lines = base.as_ptr().add(size_of::<McacheHeader>()).cast::<FragMeta>();
            for line in 0..depth_usize {
                ptr::write(
                    lines.add(line),
                    FragMeta::new(initial_seq(seq0, depth_usize, line)),
                );
            }
            (*hdr).magic.store(MCACHE_MAGIC, Ordering::Release);
        }

        debug!(depth, seq0, footprint = need, "created ring");
        // SAFETY: the header and lines were just initialized.
        Ok(unsafe { Self::from_header(hdr) })
    }

    /// Attach to the ring in `region`.
    pub fn join(region: &'a Region) -> Result<Self, ReasmError> {
        // SAFETY: the region is a live mapping borrowed for 'a.
        let mcache = unsafe { Self::join_raw(region.as_ptr())? };
        let need = Self::footprint(mcache.depth() as u64).unwrap_or(usize::MAX);
        if need > region.len() {
            warn!(len = region.len(), footprint = need, "ring larger than its region");
            return Err(ReasmError::RegionTooSmall {
                have: region.len(),
                need,
            });
        }
        Ok(mcache)
    }

    /// Attach to the ring at `shmem`. Performs no writes.
    ///
    /// # Safety
    ///
    /// `shmem` must be null or point to memory that stays mapped for 'a and
    /// covers the ring's footprint if it holds one.
    pub unsafe fn join_raw(shmem: *mut u8) -> Result<Self, ReasmError> {
        let base = check_base(shmem, MCACHE_ALIGN)?;
        let hdr = base.cast::<McacheHeader>().as_ptr();

        // SAFETY: the header is within the mapping and the magic is atomic.
        let magic = unsafe { (*hdr).magic.load(Ordering::Acquire) };
        if magic != MCACHE_MAGIC {
            warn!(addr = base.as_ptr() as usize, "bad ring magic");
            return Err(ReasmError::BadMagic);
        }
        // SAFETY: the magic guarantees an initialized header.
        let depth = unsafe { (*hdr).depth };
        if check_depth(depth).is_err() {
            warn!(depth, "ring header has invalid depth");
            return Err(ReasmError::BadMagic);
        }

        // SAFETY: a valid header is followed by `depth` initialized lines.
        Ok(unsafe { Self::from_header(hdr) })
    }

    /// Invalidate the ring in `region` so later joins fail.
    pub fn delete(region: &mut Region) -> Result<(), ReasmError> {
        // SAFETY: the exclusive borrow rules out a joined handle.
        unsafe { Self::delete_raw(region.as_ptr()).map(|_| ()) }
    }

    /// Invalidate the ring at `shmem`, returning the memory.
    ///
    /// # Safety
    ///
    /// `shmem` must be null or point to at least a ring header's worth of
    /// mapped memory.
    pub unsafe fn delete_raw(shmem: *mut u8) -> Result<NonNull<u8>, ReasmError> {
        let base = check_base(shmem, MCACHE_ALIGN)?;
        // SAFETY: header is within the mapping.
        unsafe {
            (*base.cast::<McacheHeader>().as_ptr())
                .magic
                .store(0, Ordering::Release);
        }
        debug!(addr = base.as_ptr() as usize, "deleted ring");
        Ok(base)
    }

    /// # Safety
    ///
    /// `hdr` must point to an initialized header followed by `depth`
    /// initialized lines, all mapped for 'a.
    unsafe fn from_header(hdr: *const McacheHeader) -> Self {
        // SAFETY: per the caller contract.
        unsafe {
            let lines = hdr.cast::<u8>().add(size_of::<McacheHeader>()).cast::<FragMeta>();
            Self {
                lines: Lines::Mapped(std::slice::from_raw_parts(lines, (*hdr).depth as usize)),
                seq0: (*hdr).seq0,
            }
        }
    }

    #[inline]
    fn lines(&self) -> &[FragMeta] {
        match &self.lines {
            Lines::Heap(lines) => &lines[..],
            Lines::Mapped(lines) => *lines,
        }
    }

    /// Number of lines.
    #[inline]
    pub fn depth(&self) -> usize {
        self.lines().len()
    }

    /// First sequence number this ring expects.
    #[inline]
    pub fn seq0(&self) -> u64 {
        self.seq0
    }

    /// The line holding `seq`.
    #[inline]
    pub fn line(&self, seq: u64) -> &FragMeta {
        let lines = self.lines();
        &lines[line_idx(seq, lines.len())]
    }

    /// Publish `frag` on the line for `frag.seq`.
    #[inline]
    pub fn publish(&self, frag: &Frag) {
        self.line(frag.seq).publish(frag);
    }

    /// Poll for sequence `seq`.
    #[inline]
    pub fn poll(&self, seq: u64) -> Poll {
        self.line(seq).poll(seq)
    }

    /// Whether sequence `seq` is still the one held by its line.
    #[inline]
    pub fn holds(&self, seq: u64) -> bool {
        self.line(seq).holds(seq)
    }
}

/// Copy the payload of `frag` into `dst`, returning the bytes copied.
///
/// The copy races with the writer by design; callers must confirm the copy
/// with [`Mcache::holds`] afterwards and discard it if the line moved on.
///
/// # Safety
///
/// `base` must be the data base `frag.chunk` was computed against, and the
/// chunk's memory must stay mapped for the duration of the call.
pub unsafe fn read_payload(base: *const u8, frag: &Frag, dst: &mut [u8]) -> usize {
    let len = (frag.sz as usize).min(dst.len());
    // SAFETY: caller guarantees the chunk is mapped; len is bounded by dst.
    unsafe {
        std::ptr::copy_nonoverlapping(frag.laddr(base), dst.as_mut_ptr(), len);
    }
    len
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_frag_meta_layout() {
        assert_eq!(std::mem::size_of::<FragMeta>(), 32);
        assert_eq!(std::mem::align_of::<FragMeta>(), 32);
    }

    #[test]
    fn test_ctl() {
        let ctl = frag_ctl(5, true, true, false);
        assert_eq!(ctl & CTL_SOM, CTL_SOM);
        assert_eq!(ctl & CTL_EOM, CTL_EOM);
        assert_eq!(ctl & CTL_ERR, 0);
        assert_eq!(ctl_orig(ctl), 5);
        assert_eq!(ctl_orig(frag_ctl(8191, false, false, true)), 8191);
    }

    #[test]
    fn test_seq_helpers() {
        assert_eq!(seq_dec(0, 1), u64::MAX);
        assert_eq!(seq_inc(u64::MAX, 1), 0);
        assert_eq!(seq_diff(0, u64::MAX), 1);
        assert_eq!(seq_diff(5, 7), -2);
        assert_eq!(line_idx(13, 4), 1);
    }

    #[test]
    fn test_fresh_ring_not_ready() {
        let mcache = Mcache::new(4, 100).unwrap();
        for seq in 100..104 {
            assert_eq!(mcache.poll(seq), Poll::NotReady);
        }
        // Readers that start too early see an overrun.
        assert!(matches!(mcache.poll(90), Poll::Overrun { .. }));
    }

    #[test]
    fn test_fresh_ring_wraps_seq0() {
        let mcache = Mcache::new(8, 2).unwrap();
        for seq in 2..10 {
            assert_eq!(mcache.poll(seq), Poll::NotReady);
        }
    }

    #[test]
    fn test_publish_and_overrun() {
        let mcache = Mcache::new(4, 0).unwrap();
        let frag = Frag {
            seq: 0,
            sig: 0,
            chunk: 3,
            sz: 100,
            ctl: frag_ctl(1, true, true, false),
            tsorig: 7,
            tspub: 8,
        };
        mcache.publish(&frag);
        assert_eq!(mcache.poll(0), Poll::Ready(frag));
        assert!(mcache.holds(0));

        mcache.publish(&Frag { seq: 4, ..frag });
        assert_eq!(mcache.poll(0), Poll::Overrun { seq: 4 });
        assert!(!mcache.holds(0));
        assert_eq!(mcache.poll(8), Poll::NotReady);
    }

    #[test]
    fn test_invalid_depth() {
        assert_eq!(Mcache::new(3, 0).err(), Some(ReasmError::InvalidDepth(3)));
        assert_eq!(Mcache::new(0, 0).err(), Some(ReasmError::InvalidDepth(0)));
    }

    fn ring_region(depth: u64) -> Region {
        crate::region::allocate(Mcache::footprint(depth).unwrap(), crate::HugepageSize::None)
            .unwrap()
    }

    #[test]
    fn test_footprint() {
        assert_eq!(size_of::<McacheHeader>(), 64);
        assert_eq!(Mcache::footprint(1), Some(128));
        assert_eq!(Mcache::footprint(4), Some(64 + 4 * 32));
        assert_eq!(Mcache::footprint(1024), Some(64 + 1024 * 32));
        assert_eq!(Mcache::footprint(3), None);
        assert_eq!(Mcache::footprint(0), None);
        assert_eq!(Mcache::footprint(DEPTH_MAX + 1), None);
    }

    #[test]
    fn test_mapped_ring_matches_heap_ring() {
        for (depth, seq0) in [(1, 0), (4, 100), (8, 2), (16, u64::MAX - 3)] {
            let mut region = ring_region(depth);
            let heap = Mcache::new(depth as usize, seq0).unwrap();
            let mapped = Mcache::new_in(&mut region, depth, seq0).unwrap();
            assert_eq!(mapped.depth(), depth as usize);
            assert_eq!(mapped.seq0(), seq0);
            for n in 0..depth * 2 {
                let seq = seq_inc(seq0, n);
                assert_eq!(mapped.line(seq).seq(), heap.line(seq).seq());
                assert_eq!(mapped.poll(seq), Poll::NotReady);
            }
        }
    }

    #[test]
    fn test_publish_through_joined_ring() {
        let mut region = ring_region(8);
        let frag = Frag {
            seq: 40,
            sig: 0,
            chunk: 9,
            sz: 512,
            ctl: frag_ctl(3, true, true, false),
            tsorig: 1,
            tspub: 2,
        };
        {
            let writer = Mcache::new_in(&mut region, 8, 40).unwrap();
            writer.publish(&frag);
        }

        let reader = Mcache::join(&region).unwrap();
        assert_eq!(reader.depth(), 8);
        assert_eq!(reader.seq0(), 40);
        assert_eq!(reader.poll(40), Poll::Ready(frag));
        assert_eq!(reader.poll(41), Poll::NotReady);

        // A second handle on the same memory sees the writer's later entries.
        let writer = Mcache::join(&region).unwrap();
        writer.publish(&Frag { seq: 48, ..frag });
        assert_eq!(reader.poll(40), Poll::Overrun { seq: 48 });
        assert!(!reader.holds(40));
        assert_eq!(reader.poll(48), Poll::Ready(Frag { seq: 48, ..frag }));

        // The lines sit right after the header, where foreign readers expect them.
        let line = unsafe { &*region.as_ptr().add(64).cast::<FragMeta>() };
        assert_eq!(line.seq(), 48);
    }

    #[test]
    fn test_join_rejects_foreign_memory() {
        let mut region = ring_region(4);
        assert_eq!(Mcache::join(&region).err(), Some(ReasmError::BadMagic));

        drop(Mcache::new_in(&mut region, 4, 0).unwrap());
        assert!(Mcache::join(&region).is_ok());
        Mcache::delete(&mut region).unwrap();
        assert_eq!(Mcache::join(&region).err(), Some(ReasmError::BadMagic));

        let len = region.len();
        unsafe {
            assert_eq!(
                Mcache::new_raw(std::ptr::null_mut(), len, 4, 0).err(),
                Some(ReasmError::NullMemory)
            );
            assert!(matches!(
                Mcache::new_raw(region.as_ptr().add(8), len - 8, 4, 0).err(),
                Some(ReasmError::Misaligned { align: 64, .. })
            ));
            assert!(matches!(
                Mcache::new_raw(region.as_ptr(), len, 8, 0).err(),
                Some(ReasmError::RegionTooSmall { .. })
            ));
            assert_eq!(
                Mcache::new_raw(region.as_ptr(), len, 6, 0).err(),
                Some(ReasmError::InvalidDepth(6))
            );
        }
        // Failed constructions leave the memory without a ring.
        assert_eq!(Mcache::join(&region).err(), Some(ReasmError::BadMagic));
    }
}
