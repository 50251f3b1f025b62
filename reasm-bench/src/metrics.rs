//! Benchmark metrics.

use metriken::{AtomicHistogram, Counter, metric};

// Writer
#[metric(name = "messages_published", description = "Messages published to the ring")]
pub static MESSAGES_PUBLISHED: Counter = Counter::new();

#[metric(name = "bytes_published", description = "Payload bytes published to the ring")]
pub static BYTES_PUBLISHED: Counter = Counter::new();

#[metric(name = "fragments_appended", description = "Fragments that extended a message")]
pub static FRAGMENTS_APPENDED: Counter = Counter::new();

#[metric(
    name = "fragments_already_covered",
    description = "Duplicate fragments ignored as already covered"
)]
pub static FRAGMENTS_ALREADY_COVERED: Counter = Counter::new();

#[metric(name = "messages_skipped", description = "Messages aborted after fragment loss")]
pub static MESSAGES_SKIPPED: Counter = Counter::new();

#[metric(name = "messages_too_large", description = "Messages aborted for exceeding the size limit")]
pub static MESSAGES_TOO_LARGE: Counter = Counter::new();

#[metric(name = "messages_abandoned", description = "Messages abandoned mid-stream by the sender")]
pub static MESSAGES_ABANDONED: Counter = Counter::new();

#[metric(
    name = "messages_evicted",
    description = "In-progress messages whose slot was reclaimed by a newer message"
)]
pub static MESSAGES_EVICTED: Counter = Counter::new();

#[metric(name = "corruption_resets", description = "Pool resets after detected corruption")]
pub static CORRUPTION_RESETS: Counter = Counter::new();

#[metric(
    name = "publish_latency",
    description = "Publish call latency histogram (nanoseconds)"
)]
pub static PUBLISH_LATENCY: AtomicHistogram = AtomicHistogram::new(7, 64);

// Consumers
#[metric(name = "consumer_reads", description = "Ring entries read and verified")]
pub static CONSUMER_READS: Counter = Counter::new();

#[metric(name = "consumer_overruns", description = "Ring entries overwritten before being read")]
pub static CONSUMER_OVERRUNS: Counter = Counter::new();

#[metric(name = "consumer_errors", description = "Ring entries whose payload failed verification")]
pub static CONSUMER_ERRORS: Counter = Counter::new();
