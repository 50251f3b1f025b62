//! Pool behavior tests.
//!
//! These drive a pool through its writer surface over a real mmap region and
//! check the slot bookkeeping and the ring entries it produces.

#![cfg(not(feature = "loom"))]

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use reasm::{
    AppendError, Appended, CHUNK_STRIDE, HugepageSize, MAX_MESSAGE_SIZE, Mcache, Poll,
    PublishError, Reasm, ReasmBuilder, Region, SlotId, SlotState, allocate, ctl_orig,
    read_payload,
};

fn pool(depth: u64, burst: u64) -> Region {
    ReasmBuilder::new(depth)
        .burst(burst)
        .origin(5)
        .build()
        .expect("failed to create pool")
}

/// Position-dependent payload so misplaced bytes are detected.
fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Bytes of pool metadata (everything below the chunks).
fn metadata(reasm: &Reasm<'_>, base: *const u8) -> Vec<u8> {
    let len = (reasm.chunk0(base) as usize) << 6;
    unsafe { std::slice::from_raw_parts(base, len) }.to_vec()
}

fn read(mcache: &Mcache<'_>, base: *const u8, seq: u64) -> Vec<u8> {
    let Poll::Ready(frag) = mcache.poll(seq) else {
        panic!("sequence {seq} not published");
    };
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let len = unsafe { read_payload(base, &frag, &mut buf) };
    assert!(mcache.holds(seq), "sequence {seq} overwritten during read");
    buf.truncate(len);
    buf
}

// =============================================================================
// Lifecycle
// =============================================================================

#[test]
fn test_reset_is_byte_identical() {
    for (depth, burst) in [(1, 2), (2, 2), (4, 2), (8, 3), (64, 17), (256, 64)] {
        let mut region = pool(depth, burst);
        let base = region.as_ptr() as *const u8;
        let mut reasm = Reasm::join(&mut region).unwrap();
        let fresh = metadata(&reasm, base);

        let mcache = Mcache::new(depth as usize, 0).unwrap();
        for seq in 0..depth * 3 {
            let id = reasm.prepare(seq);
            reasm.set_owner(id, seq, seq * 4);
            reasm.append(id, &payload(17, seq as u8), 0).unwrap();
            if seq % 5 == 4 {
                reasm.cancel(id);
            } else {
                reasm.publish(id, &mcache, base, seq, seq).unwrap();
            }
        }
        reasm.prepare(99);
        assert_ne!(metadata(&reasm, base), fresh);

        reasm.reset();
        assert_eq!(metadata(&reasm, base), fresh, "depth={depth} burst={burst}");
        reasm.verify().unwrap();
    }
}

#[test]
fn test_join_sees_writer_state() {
    let mut region = pool(8, 2);
    let base = region.as_ptr() as *const u8;
    let mcache = Mcache::new(8, 0).unwrap();
    {
        let mut reasm = Reasm::join(&mut region).unwrap();
        let id = reasm.prepare(1);
        reasm.append(id, b"carried over", 0).unwrap();
        reasm.publish(id, &mcache, base, 0, 2).unwrap();
        reasm.leave();
    }
    let reasm = Reasm::join(&mut region).unwrap();
    reasm.verify().unwrap();
    assert_eq!(reasm.line_owner(0).and_then(|id| reasm.data(id)), Some(&b"carried over"[..]));
}

#[test]
fn test_join_rejects_foreign_memory() {
    let mut region = reasm::allocate(reasm::footprint(4, 2).unwrap(), Default::default()).unwrap();
    unsafe { std::ptr::write_bytes(region.as_ptr(), 0xa5, region.len()) };
    assert_eq!(Reasm::join(&mut region).err(), Some(reasm::ReasmError::BadMagic));
}

// =============================================================================
// Reference scenario
// =============================================================================

#[test]
fn test_depth4_burst2_scenario() {
    let mut region = pool(4, 2);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(4, 4).unwrap();
    reasm.reset();

    let victim = reasm.line_owner(0).unwrap();
    assert_eq!(victim.index(), 0);

    let slot = reasm.begin(7);
    assert_eq!(slot.index(), 4);
    let data = payload(100, 1);
    assert_eq!(reasm.append(slot, &data, 0), Ok(Appended::Extended { size: 100 }));
    assert_eq!(reasm.slot_info(slot).unwrap().size, 100);

    reasm.publish(slot, &mcache, base, 4, 9).unwrap();
    assert_eq!(reasm.slot_info(slot).unwrap().state, SlotState::Published);
    assert_eq!(reasm.line_owner(0), Some(slot));
    assert_eq!(reasm.slot_info(victim).unwrap().state, SlotState::Free);

    let Poll::Ready(frag) = mcache.poll(4) else {
        panic!("entry not published");
    };
    assert_eq!(frag.seq, 4);
    assert_eq!(frag.sz, 100);
    assert_eq!(frag.tsorig, 7);
    assert_eq!(frag.tspub, 9);
    assert_eq!(ctl_orig(frag.ctl), 5);
    assert_eq!(read(&mcache, base, 4), data);

    // The evicted owner sits at the tail, so it is handed out next.
    assert_eq!(reasm.begin(8), victim);
    reasm.verify().unwrap();
}

// =============================================================================
// Append outcomes
// =============================================================================

#[test]
fn test_round_trip_contiguous_fragments() {
    let mut region = pool(16, 4);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(16, 0).unwrap();

    let message = payload(MAX_MESSAGE_SIZE, 3);
    let id = reasm.prepare(0);
    let mut offset = 0;
    for frag in message.chunks(97) {
        assert_eq!(
            reasm.append(id, frag, offset),
            Ok(Appended::Extended { size: offset + frag.len() })
        );
        offset += frag.len();
    }
    reasm.publish(id, &mcache, base, 0, 0).unwrap();
    assert_eq!(read(&mcache, base, 0), message);
}

#[test]
fn test_overlapping_fragments() {
    let mut region = pool(4, 2);
    let mut reasm = Reasm::join(&mut region).unwrap();
    let message = payload(300, 9);
    let id = reasm.prepare(0);

    reasm.append(id, &message[..200], 0).unwrap();

    // Fully covered: no-op.
    assert_eq!(reasm.append(id, &message[50..150], 50), Ok(Appended::AlreadyCovered));
    assert_eq!(reasm.append(id, &message[100..200], 100), Ok(Appended::AlreadyCovered));
    assert_eq!(reasm.append(id, &[], 200), Ok(Appended::Extended { size: 200 }));
    assert_eq!(reasm.slot_info(id).unwrap().size, 200);

    // Partially covered: only the new tail is appended.
    assert_eq!(
        reasm.append(id, &message[150..300], 150),
        Ok(Appended::Extended { size: 300 })
    );
    assert_eq!(reasm.data(id), Some(&message[..]));
}

#[test]
fn test_skipped_data_aborts_message() {
    let mut region = pool(4, 2);
    let mut reasm = Reasm::join(&mut region).unwrap();
    let id = reasm.prepare(0);
    reasm.append(id, &[1; 10], 0).unwrap();

    assert_eq!(
        reasm.append(id, &[2; 10], 20),
        Err(AppendError::Skipped { offset: 20, size: 10 })
    );
    let info = reasm.slot_info(id).unwrap();
    assert_eq!(info.state, SlotState::Free);
    assert_eq!(info.size, 0);
    assert_eq!(reasm.append(id, &[2; 10], 10), Err(AppendError::NotBusy));
    reasm.verify().unwrap();
}

#[test]
fn test_too_large_aborts_without_touching_neighbors() {
    let mut region = pool(4, 4);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(4, 0).unwrap();

    let published = payload(MAX_MESSAGE_SIZE, 1);
    let id = reasm.prepare(0);
    reasm.append(id, &published, 0).unwrap();
    reasm.publish(id, &mcache, base, 0, 0).unwrap();

    let neighbor = reasm.prepare(1);
    let partial = payload(600, 2);
    reasm.append(neighbor, &partial, 0).unwrap();

    let big = reasm.prepare(2);
    reasm.append(big, &payload(MAX_MESSAGE_SIZE, 3), 0).unwrap();
    assert_eq!(
        reasm.append(big, &[0xff; 1], MAX_MESSAGE_SIZE),
        Err(AppendError::TooLarge { size: MAX_MESSAGE_SIZE + 1 })
    );
    assert_eq!(reasm.slot_info(big).unwrap().state, SlotState::Free);

    // A single oversized fragment is rejected the same way.
    let big = reasm.prepare(3);
    assert_eq!(
        reasm.append(big, &vec![0xee; CHUNK_STRIDE + 1], 0),
        Err(AppendError::TooLarge { size: CHUNK_STRIDE + 1 })
    );

    assert_eq!(reasm.data(neighbor), Some(&partial[..]));
    assert_eq!(read(&mcache, base, 0), published);
    reasm.verify().unwrap();
}

#[test]
fn test_contract_violations() {
    let mut region = pool(4, 2);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(4, 0).unwrap();

    let published = reasm.line_owner(1).unwrap();
    assert_eq!(reasm.append(published, b"x", 0), Err(AppendError::NotBusy));
    assert_eq!(
        reasm.publish(published, &mcache, base, 1, 0),
        Err(PublishError::NotBusy)
    );

    let id = reasm.prepare(0);
    reasm.cancel(id);
    // Cancelling twice is harmless; the handle is stale afterwards.
    reasm.cancel(id);
    assert_eq!(reasm.publish(id, &mcache, base, 0, 0), Err(PublishError::NotBusy));

    // Cancelling a published slot does nothing.
    reasm.cancel(published);
    assert_eq!(reasm.slot_info(published).unwrap().state, SlotState::Published);
    reasm.verify().unwrap();
}

// =============================================================================
// Publish
// =============================================================================

#[test]
fn test_eviction_keeps_latest_depth_messages() {
    const DEPTH: u64 = 8;
    let mut region = pool(DEPTH, 4);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(DEPTH as usize, 100).unwrap();

    let mut ids = Vec::new();
    for seq in 100..100 + 3 * DEPTH {
        let id = reasm.prepare(seq);
        reasm.append(id, &payload(40, seq as u8), 0).unwrap();
        reasm.publish(id, &mcache, base, seq, seq).unwrap();
        ids.push(id);
    }

    let latest = &ids[ids.len() - DEPTH as usize..];
    let mut owners: Vec<SlotId> = (0..DEPTH as usize).filter_map(|l| reasm.line_owner(l)).collect();
    let mut expected = latest.to_vec();
    owners.sort_by_key(|id| id.index());
    expected.sort_by_key(|id| id.index());
    assert_eq!(owners, expected);

    for seq in 100 + 2 * DEPTH..100 + 3 * DEPTH {
        assert_eq!(read(&mcache, base, seq), payload(40, seq as u8));
    }
    // Older sequences were overwritten.
    assert!(matches!(mcache.poll(100), Poll::Overrun { .. }));

    let metrics = reasm.metrics();
    assert_eq!(metrics.published, DEPTH as u32);
    assert_eq!(metrics.free, 4);
    reasm.verify().unwrap();
}

#[test]
fn test_interleaved_streams() {
    let mut region = pool(4, 3);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(4, 0).unwrap();

    let a = reasm.prepare(0);
    reasm.set_owner(a, 1, 0);
    let b = reasm.prepare(0);
    reasm.set_owner(b, 1, 4);

    reasm.append(a, b"stream ", 0).unwrap();
    reasm.append(b, b"other ", 0).unwrap();
    reasm.append(a, b"zero", 7).unwrap();
    reasm.append(b, b"stream", 6).unwrap();

    // Completing out of start order publishes without disturbing the other.
    let b = reasm.query(1, 4).unwrap();
    reasm.publish(b, &mcache, base, 0, 0).unwrap();
    let a = reasm.query(1, 0).unwrap();
    reasm.publish(a, &mcache, base, 1, 0).unwrap();

    assert_eq!(read(&mcache, base, 0), b"other stream");
    assert_eq!(read(&mcache, base, 1), b"stream zero");
    reasm.verify().unwrap();
}

#[test]
fn test_abandoned_message_is_evicted() {
    let mut region = pool(4, 2);
    let mut reasm = Reasm::join(&mut region).unwrap();

    let stale = reasm.prepare(0);
    reasm.set_owner(stale, 7, 0);
    reasm.append(stale, b"never finished", 0).unwrap();
    let _live = reasm.prepare(1);

    // Both spare slots are busy; the oldest is reclaimed.
    let fresh = reasm.prepare(2);
    assert_eq!(fresh, stale);
    assert_eq!(reasm.query(7, 0), None);
    assert_eq!(reasm.slot_info(fresh).unwrap().size, 0);
    reasm.verify().unwrap();
}

#[test]
fn test_publish_into_mapped_ring() {
    let mut region = pool(8, 2);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();

    let mut ring = allocate(Mcache::footprint(8).unwrap(), HugepageSize::None).unwrap();
    let writer = Mcache::new_in(&mut ring, 8, 1_000).unwrap();

    let messages: Vec<Vec<u8>> = (0..12).map(|i| payload(50 + i * 90, i as u8)).collect();
    for (seq, data) in (1_000..).zip(&messages) {
        let id = reasm.prepare(seq);
        for (n, frag) in data.chunks(300).enumerate() {
            reasm.append(id, frag, n * 300).unwrap();
        }
        reasm.publish(id, &writer, base, seq, seq).unwrap();
    }
    drop(writer);

    // A reader attaching afterwards sees the last `depth` messages.
    let reader = Mcache::join(&ring).unwrap();
    assert_eq!(reader.seq0(), 1_000);
    assert!(matches!(reader.poll(1_003), Poll::Overrun { seq: 1_011 }));
    for (seq, data) in (1_004..).zip(&messages[4..]) {
        assert_eq!(&read(&reader, base, seq), data);
    }
    assert_eq!(reader.poll(1_012), Poll::NotReady);
    reasm.verify().unwrap();
}

#[test]
fn test_publish_rejects_bad_base() {
    let mut region = pool(4, 2);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(4, 0).unwrap();
    let id = reasm.prepare(0);

    let above = base.wrapping_add(1 << 40);
    assert!(matches!(
        reasm.publish(id, &mcache, above, 0, 0),
        Err(PublishError::ChunkOutOfRange { .. })
    ));
    // Nothing changed: the slot can still be published against a good base.
    assert_eq!(reasm.slot_info(id).unwrap().state, SlotState::Busy);

    let wrong_ring = Mcache::new(8, 0).unwrap();
    assert_eq!(
        reasm.publish(id, &wrong_ring, base, 0, 0),
        Err(PublishError::DepthMismatch { pool: 4, ring: 8 })
    );

    reasm.publish(id, &mcache, base, 0, 0).unwrap();
    reasm.verify().unwrap();
}

// =============================================================================
// Randomized invariants
// =============================================================================

#[test]
fn test_random_operations_preserve_invariants() {
    const DEPTH: u64 = 16;
    const BURST: u64 = 5;
    let mut region = pool(DEPTH, BURST);
    let base = region.as_ptr() as *const u8;
    let mut reasm = Reasm::join(&mut region).unwrap();
    let mcache = Mcache::new(DEPTH as usize, 0).unwrap();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5eed);

    let mut seq = 0u64;
    let mut open: Vec<(SlotId, Vec<u8>)> = Vec::new();
    for step in 0..20_000u64 {
        match rng.random_range(0..10) {
            0..=2 => {
                let id = reasm.prepare(step);
                open.retain(|(other, _)| *other != id);
                open.push((id, Vec::new()));
            }
            3..=6 if !open.is_empty() => {
                let i = rng.random_range(0..open.len());
                let (id, expect) = &mut open[i];
                let id = *id;
                let len = rng.random_range(0..200);
                let frag = payload(len, step as u8);
                match reasm.append(id, &frag, expect.len()) {
                    Ok(Appended::Extended { size }) => {
                        expect.extend_from_slice(&frag);
                        assert_eq!(size, expect.len());
                    }
                    Err(AppendError::TooLarge { .. }) => {
                        open.swap_remove(i);
                    }
                    other => panic!("unexpected append outcome {other:?}"),
                }
            }
            7..=8 if !open.is_empty() => {
                let i = rng.random_range(0..open.len());
                let (id, expect) = open.swap_remove(i);
                reasm.publish(id, &mcache, base, seq, step).unwrap();
                assert_eq!(read(&mcache, base, seq), expect);
                seq += 1;
            }
            9 if !open.is_empty() => {
                let i = rng.random_range(0..open.len());
                let (id, _) = open.swap_remove(i);
                reasm.cancel(id);
            }
            _ => {}
        }

        // Handles evicted by prepare are no longer busy.
        open.retain(|(id, _)| reasm.slot_info(*id).unwrap().state == SlotState::Busy);

        let metrics = reasm.metrics();
        assert!(metrics.is_consistent());
        assert_eq!(metrics.published, DEPTH as u32);
        if step % 64 == 0 {
            reasm.verify().unwrap();
        }
    }
    reasm.verify().unwrap();
}
