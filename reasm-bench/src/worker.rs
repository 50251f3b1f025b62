//! Writer and consumer threads.
//!
//! The writer plays the transport: it keeps `streams` messages in flight and
//! feeds their fragments into the pool in random interleaving, injecting
//! duplicates, losses and abandoned messages. Consumers follow the ring and
//! verify every payload they manage to read before it is overwritten.

use crate::config::{Config, MESSAGE_HEADER_LEN, WorkloadConfig};
use crate::metrics;

use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use reasm::{
    AppendError, Appended, MAX_MESSAGE_SIZE, Mcache, Poll, PoolMetrics, PublishError, Reasm,
    SlotId, read_payload, seq_diff,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Shared state between main thread and workers.
pub struct SharedState {
    running: AtomicBool,
    start: Instant,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Nanoseconds since the benchmark started.
    #[inline]
    pub fn now(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Payload byte `i` of message `serial`.
#[inline]
fn message_byte(serial: u64, i: usize) -> u8 {
    (serial as u8).wrapping_add((i as u8).wrapping_mul(31))
}

/// Fill `buf` with a self-describing message.
fn write_message(buf: &mut [u8], serial: u64) {
    buf[..8].copy_from_slice(&serial.to_le_bytes());
    let len = buf.len() as u16;
    buf[8..MESSAGE_HEADER_LEN].copy_from_slice(&len.to_le_bytes());
    for (i, b) in buf.iter_mut().enumerate().skip(MESSAGE_HEADER_LEN) {
        *b = message_byte(serial, i);
    }
}

/// Check a payload written by [`write_message`].
fn verify_message(buf: &[u8]) -> bool {
    if buf.len() < MESSAGE_HEADER_LEN {
        return false;
    }
    let mut serial = [0u8; 8];
    serial.copy_from_slice(&buf[..8]);
    let serial = u64::from_le_bytes(serial);
    let len = u16::from_le_bytes([buf[8], buf[9]]) as usize;
    len == buf.len()
        && buf
            .iter()
            .enumerate()
            .skip(MESSAGE_HEADER_LEN)
            .all(|(i, &b)| b == message_byte(serial, i))
}

/// A sender-side stream with at most one message in flight.
struct Stream {
    conn_uid: u64,
    stream_id: u64,
    slot: SlotId,
    message: Vec<u8>,
    sent: usize,
}

/// Generates self-describing messages and opens a slot for each.
struct MessageSource<'c> {
    workload: &'c WorkloadConfig,
    rng: Xoshiro256PlusPlus,
    serial: u64,
}

impl MessageSource<'_> {
    fn start(&mut self, reasm: &mut Reasm<'_>, tsorig: u64, conn_uid: u64) -> Stream {
        let len = self
            .rng
            .random_range(self.workload.message.min..=self.workload.message.max);
        let mut message = vec![0u8; len];
        write_message(&mut message, self.serial);
        self.serial += 1;

        // Every message gets a fresh stream id, as a transport opening a new stream would.
        let slot = reasm.prepare(tsorig);
        reasm.set_owner(slot, conn_uid, self.serial);
        Stream {
            conn_uid,
            stream_id: self.serial,
            slot,
            message,
            sent: 0,
        }
    }
}

/// Run the writer until stopped. Returns the final pool state.
pub fn run_writer(
    config: &Config,
    reasm: &mut Reasm<'_>,
    mcache: &Mcache<'_>,
    base: *const u8,
    shared: &SharedState,
) -> Result<PoolMetrics, PublishError> {
    let workload = &config.workload;
    let mut seq = mcache.seq0();
    let mut source = MessageSource {
        workload,
        rng: Xoshiro256PlusPlus::seed_from_u64(config.general.seed),
        serial: 0,
    };
    let mut streams: Vec<Stream> = (0..workload.streams as u64)
        .map(|conn_uid| source.start(reasm, shared.now(), conn_uid))
        .collect();

    while shared.is_running() {
        let idx = source.rng.random_range(0..streams.len());
        let stream = &mut streams[idx];

        // The slot may have been reclaimed for a newer message.
        if reasm.query(stream.conn_uid, stream.stream_id) != Some(stream.slot) {
            metrics::MESSAGES_EVICTED.increment();
            *stream = source.start(reasm, shared.now(), stream.conn_uid);
            continue;
        }

        if source.rng.random_range(0..100) < workload.abandon {
            metrics::MESSAGES_ABANDONED.increment();
            *stream = source.start(reasm, shared.now(), stream.conn_uid);
            continue;
        }

        let duplicate = stream.sent > 0 && source.rng.random_range(0..100) < workload.duplicate;
        let offset = if duplicate {
            source.rng.random_range(0..stream.sent)
        } else {
            stream.sent
        };
        let end = (offset + workload.fragment_size).min(stream.message.len());

        if !duplicate && source.rng.random_range(0..100) < workload.loss {
            stream.sent = end;
            if stream.sent < stream.message.len() {
                continue;
            }
            // Losing the last fragment leaves nothing to trip over; drop it here.
            reasm.cancel(stream.slot);
            metrics::MESSAGES_SKIPPED.increment();
            *stream = source.start(reasm, shared.now(), stream.conn_uid);
            continue;
        }

        match reasm.append(stream.slot, &stream.message[offset..end], offset) {
            Ok(Appended::Extended { .. }) => {
                metrics::FRAGMENTS_APPENDED.increment();
                stream.sent = stream.sent.max(end);
            }
            Ok(Appended::AlreadyCovered) => {
                metrics::FRAGMENTS_ALREADY_COVERED.increment();
            }
            Err(AppendError::Skipped { .. }) => {
                metrics::MESSAGES_SKIPPED.increment();
                *stream = source.start(reasm, shared.now(), stream.conn_uid);
                continue;
            }
            Err(AppendError::TooLarge { .. }) => {
                metrics::MESSAGES_TOO_LARGE.increment();
                *stream = source.start(reasm, shared.now(), stream.conn_uid);
                continue;
            }
            Err(AppendError::NotBusy) => {
                warn!(slot = stream.slot.index(), "append to a slot that is not busy");
                *stream = source.start(reasm, shared.now(), stream.conn_uid);
                continue;
            }
        }

        if stream.sent < stream.message.len() {
            continue;
        }

        let start = Instant::now();
        let result = reasm.publish(stream.slot, mcache, base, seq, shared.now());
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        match result {
            Ok(()) => {
                metrics::MESSAGES_PUBLISHED.increment();
                metrics::BYTES_PUBLISHED.add(stream.message.len() as u64);
                let _ = metrics::PUBLISH_LATENCY.increment(elapsed_ns);
                seq = seq.wrapping_add(1);
            }
            Err(PublishError::Corrupt(corruption)) => {
                metrics::CORRUPTION_RESETS.increment();
                debug!(%corruption, "publish recovered from corruption");
            }
            Err(PublishError::NotBusy) => {
                warn!(slot = stream.slot.index(), "publish of a slot that is not busy");
            }
            Err(e) => return Err(e),
        }
        *stream = source.start(reasm, shared.now(), stream.conn_uid);
    }

    if let Err(corruption) = reasm.verify() {
        warn!(%corruption, "pool failed verification at shutdown");
    }
    Ok(reasm.metrics())
}

/// Follow the ring from its first sequence until stopped.
pub fn run_consumer(mcache: &Mcache<'_>, base: usize, shared: &SharedState) {
    let base = base as *const u8;
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let mut seq = mcache.seq0();

    while shared.is_running() {
        match mcache.poll(seq) {
            Poll::NotReady => std::hint::spin_loop(),
            Poll::Overrun { seq: newer } => {
                metrics::CONSUMER_OVERRUNS.increment();
                // Skip ahead to the entry that overwrote us.
                seq = if seq_diff(newer, seq) > 0 {
                    newer
                } else {
                    seq.wrapping_add(1)
                };
            }
            Poll::Ready(frag) => {
                // SAFETY: base is the start of the pool region, which outlives
                // the consumer threads.
                let len = unsafe { read_payload(base, &frag, &mut buf) };
                if !mcache.holds(seq) {
                    metrics::CONSUMER_OVERRUNS.increment();
                } else if verify_message(&buf[..len]) {
                    metrics::CONSUMER_READS.increment();
                } else {
                    metrics::CONSUMER_ERRORS.increment();
                    warn!(seq, size = len, "payload failed verification");
                }
                seq = seq.wrapping_add(1);
            }
        }
    }
}
