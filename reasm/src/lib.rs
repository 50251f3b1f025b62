//! reasm: lock-free reassembly slot pool feeding a publish ring.
//!
//! A transport receives messages as ordered fragments on many streams at
//! once. Each in-progress message gets a fixed-size slot; fragments are
//! appended in order, and a completed message is published into a ring
//! ([`Mcache`]) of `depth` lines without being copied. The pool holds
//! `depth + burst` slots: `depth` of them always back the ring lines, the
//! other `burst` hold messages still being reassembled.
//!
//! - **Layout**: a pool lives in one caller-owned region ([`footprint`],
//!   [`align`]), addressed by offsets so it can be joined from any mapping
//! - **Slots**: Free -> Busy -> Published -> Free, tracked per slot
//! - **Free list**: index-linked, ordered by last use, so abandoned messages
//!   are evicted oldest first
//! - **Publish**: slot ownership swap plus a two-phase sequence write that
//!   lets concurrent readers detect torn or overwritten entries
//!
//! The pool has a single writer. Readers only ever touch the ring and the
//! chunk memory, and must re-check the entry's sequence after copying data
//! out. Like the pool, the ring can be laid out in a shared [`Region`]
//! ([`Mcache::new_in`]) and attached to by readers elsewhere
//! ([`Mcache::join`]).
//!
//! # Architecture
//!
//! ```text
//!   fragments                                   +------------------+
//!  ----------> prepare / append / cancel        |  Mcache (ring)   |
//!              +--------------------+  publish  |  line = seq % d  |
//!              | Reasm              |---------->|  seq-1 .. fields |
//!              |  free list (burst) |           |  .. seq          |
//!              |  index map (depth) |           +--------+---------+
//!              |  chunks            |<-------------------+ readers copy
//!              +--------------------+     chunk index     payloads out
//! ```
//!
//! # Example
//!
//! ```
//! use reasm::{HugepageSize, Mcache, Poll, Reasm, ReasmBuilder, allocate, read_payload};
//!
//! let mut region = ReasmBuilder::new(4).burst(2).build()?;
//! let base = region.as_ptr() as *const u8;
//! let mut reasm = Reasm::join(&mut region)?;
//!
//! let mut ring = allocate(Mcache::footprint(4).unwrap(), HugepageSize::None)?;
//! let mcache = Mcache::new_in(&mut ring, 4, 0)?;
//!
//! let slot = reasm.prepare(0);
//! reasm.append(slot, b"hello ", 0)?;
//! reasm.append(slot, b"world", 6)?;
//! reasm.publish(slot, &mcache, base, 0, 0)?;
//!
//! let Poll::Ready(frag) = mcache.poll(0) else { panic!("not published") };
//! let mut buf = [0u8; 1232];
//! let len = unsafe { read_payload(base, &frag, &mut buf) };
//! assert_eq!(&buf[..len], b"hello world");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod layout;
mod mcache;
mod metrics;
mod reasm;
mod region;
mod slot;
mod slotq;
mod sync;

pub use error::{AppendError, Appended, Corruption, PublishError, ReasmError};
pub use layout::{
    BURST_MAX, CHUNK_ALIGN, CHUNK_LG_SZ, CHUNK_STRIDE, DEPTH_MAX, MAX_MESSAGE_SIZE, ORIGIN_MAX,
    REASM_ALIGN, align, chunk_to_laddr, footprint, laddr_to_chunk,
};
pub use mcache::{
    CTL_EOM, CTL_ERR, CTL_ORIG_SHIFT, CTL_SOM, Frag, FragMeta, MCACHE_ALIGN, Mcache, Poll,
    ctl_orig, frag_ctl, line_idx, read_payload, seq_dec, seq_diff, seq_inc,
};
pub use metrics::PoolMetrics;
pub use reasm::{Reasm, ReasmBuilder};
pub use region::{AllocatedPageSize, HugepageSize, Region, allocate};
pub use slot::{SLOT_IDX_NONE, SlotId, SlotInfo, SlotState};
