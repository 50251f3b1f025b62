//! Concurrent reader tests.
//!
//! One writer thread reassembles and publishes while reader threads poll the
//! ring and copy payloads out of the shared region. The ring lives in its own
//! mapped region and every thread attaches to it separately. Readers must
//! never accept a payload that differs from what was published under that
//! sequence.

#![cfg(not(feature = "loom"))]

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use reasm::{
    HugepageSize, MAX_MESSAGE_SIZE, Mcache, Poll, Reasm, ReasmBuilder, allocate, read_payload,
};

const MESSAGES: u64 = 200_000;

fn message_len(seq: u64) -> usize {
    1 + (seq.wrapping_mul(7919) % MAX_MESSAGE_SIZE as u64) as usize
}

fn message_byte(seq: u64, i: usize) -> u8 {
    (seq as u8) ^ (i as u8).wrapping_mul(13)
}

#[derive(Default)]
struct ReaderStats {
    verified: AtomicU64,
    overruns: AtomicU64,
}

fn run(depth: u64, burst: u64, readers: usize) -> ReaderStats {
    let mut region = ReasmBuilder::new(depth)
        .burst(burst)
        .build()
        .expect("failed to create pool");
    let base = region.as_ptr() as usize;
    let mut ring = allocate(Mcache::footprint(depth).unwrap(), HugepageSize::None).unwrap();
    Mcache::new_in(&mut ring, depth, 0).unwrap();
    let ring = &ring;
    let stats = ReaderStats::default();

    thread::scope(|s| {
        for _ in 0..readers {
            s.spawn(|| {
                let mcache = Mcache::join(ring).unwrap();
                let base = base as *const u8;
                let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
                let mut seq = 0;
                while seq < MESSAGES {
                    match mcache.poll(seq) {
                        Poll::NotReady => std::hint::spin_loop(),
                        Poll::Overrun { .. } => {
                            stats.overruns.fetch_add(1, Ordering::Relaxed);
                            seq += 1;
                        }
                        Poll::Ready(frag) => {
                            let len = unsafe { read_payload(base, &frag, &mut buf) };
                            if mcache.holds(seq) {
                                assert_eq!(len, message_len(seq), "size mismatch at {seq}");
                                for (i, &b) in buf[..len].iter().enumerate() {
                                    assert_eq!(b, message_byte(seq, i), "torn payload at {seq}");
                                }
                                stats.verified.fetch_add(1, Ordering::Relaxed);
                            } else {
                                stats.overruns.fetch_add(1, Ordering::Relaxed);
                            }
                            seq += 1;
                        }
                    }
                }
            });
        }

        let mut reasm = Reasm::join(&mut region).unwrap();
        let mcache = Mcache::join(ring).unwrap();
        let base = base as *const u8;
        let mut msg = vec![0u8; MAX_MESSAGE_SIZE];
        for seq in 0..MESSAGES {
            let len = message_len(seq);
            for (i, b) in msg[..len].iter_mut().enumerate() {
                *b = message_byte(seq, i);
            }
            let id = reasm.prepare(seq);
            let mut offset = 0;
            for frag in msg[..len].chunks(400) {
                reasm.append(id, frag, offset).unwrap();
                offset += frag.len();
            }
            reasm.publish(id, &mcache, base, seq, seq).unwrap();
        }
        reasm.verify().unwrap();
    });

    stats
}

#[test]
fn test_single_reader() {
    let stats = run(64, 8, 1);
    let verified = stats.verified.load(Ordering::Relaxed);
    let overruns = stats.overruns.load(Ordering::Relaxed);
    assert_eq!(verified + overruns, MESSAGES);
    assert!(verified > 0);
}

#[test]
fn test_multiple_readers_small_ring() {
    // A tiny ring forces frequent overwrites under the readers.
    let stats = run(4, 2, 4);
    let verified = stats.verified.load(Ordering::Relaxed);
    let overruns = stats.overruns.load(Ordering::Relaxed);
    assert_eq!(verified + overruns, 4 * MESSAGES);
}
