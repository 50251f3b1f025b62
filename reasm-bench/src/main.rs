//! Synthetic multi-stream reassembly benchmark: one writer thread feeds
//! interleaved fragments from many streams into a pool while consumer
//! threads follow the publish ring and verify every payload they read.

mod config;
mod logging;
mod metrics;
mod worker;

use crate::config::Config;
use crate::worker::SharedState;

use clap::Parser;
use metriken::{AtomicHistogram, histogram::Histogram};
use reasm::{Mcache, PoolMetrics, Reasm, ReasmBuilder, allocate};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser)]
#[command(name = "reasm-bench")]
#[command(about = "Synthetic multi-stream reassembly benchmark")]
struct Args {
    /// Path to configuration file
    config: PathBuf,

    /// Override the configured run duration (e.g., "30s")
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,
}

fn main() {
    let args = Args::parse();

    let mut config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    if let Some(duration) = args.duration {
        config.general.duration = duration;
    }

    logging::init(&config.logging);

    if let Err(e) = run(config) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Counter totals at one point in time.
#[derive(Clone, Copy, Default)]
struct Totals {
    published: u64,
    bytes: u64,
    reads: u64,
    overruns: u64,
    aborted: u64,
}

impl Totals {
    fn load() -> Self {
        Self {
            published: metrics::MESSAGES_PUBLISHED.value(),
            bytes: metrics::BYTES_PUBLISHED.value(),
            reads: metrics::CONSUMER_READS.value(),
            overruns: metrics::CONSUMER_OVERRUNS.value(),
            aborted: metrics::MESSAGES_SKIPPED.value()
                + metrics::MESSAGES_TOO_LARGE.value()
                + metrics::MESSAGES_ABANDONED.value()
                + metrics::MESSAGES_EVICTED.value(),
        }
    }
}

fn run(config: Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    print_config(&config);

    let cpu_ids = match config.general.cpu_list {
        Some(ref cpu_list) => {
            Some(config::parse_cpu_list(cpu_list).map_err(|e| format!("invalid cpu_list: {e}"))?)
        }
        None => None,
    };

    let mut region = ReasmBuilder::new(config.pool.depth)
        .burst(config.pool.burst)
        .origin(config.pool.origin)
        .hugepage_size(config.pool.hugepages.into())
        .build()?;
    info!(
        footprint = region.len(),
        page_size = %region.page_size(),
        "pool region mapped"
    );
    let base = region.as_ptr() as usize;

    let ring_size = Mcache::footprint(config.pool.depth)
        .ok_or_else(|| format!("invalid pool depth {}", config.pool.depth))?;
    let mut ring = allocate(ring_size, config.pool.hugepages.into())?;
    info!(footprint = ring_size, page_size = %ring.page_size(), "ring region mapped");
    let mcache = Mcache::new_in(&mut ring, config.pool.depth, 0)?;

    // Signal handler
    let shared = Arc::new(SharedState::new());
    let handler = Arc::clone(&shared);
    ctrlc::set_handler(move || handler.stop())?;

    let config = &config;
    let mcache = &mcache;
    let shared = &*shared;
    let region = &mut region;
    let cpu_ids = cpu_ids.as_deref();

    let pool = thread::scope(|s| -> Result<PoolMetrics, Box<dyn Error + Send + Sync>> {
        for id in 0..config.general.consumers {
            thread::Builder::new()
                .name(format!("consumer-{id}"))
                .spawn_scoped(s, move || {
                    if let Some(ids) = cpu_ids
                        && !ids.is_empty()
                    {
                        let _ = pin_to_cpu(ids[(id + 1) % ids.len()]);
                    }
                    worker::run_consumer(mcache, base, shared);
                })?;
        }

        let writer = thread::Builder::new()
            .name("writer".to_string())
            .spawn_scoped(
                s,
                move || -> Result<PoolMetrics, Box<dyn Error + Send + Sync>> {
                    if let Some(&cpu) = cpu_ids.and_then(|ids| ids.first()) {
                        let _ = pin_to_cpu(cpu);
                    }
                    let mut reasm = Reasm::join(region)?;
                    info!(depth = reasm.depth(), burst = reasm.burst(), "writer started");
                    let pool =
                        worker::run_writer(config, &mut reasm, mcache, base as *const u8, shared)?;
                    Ok(pool)
                },
            )?;

        report(config, shared, || writer.is_finished());
        shared.stop();

        writer.join().map_err(|_| "writer thread panicked")?
    })?;

    print_summary(config, &pool);

    Ok(())
}

/// Print one line per second until the run ends.
fn report(config: &Config, shared: &SharedState, writer_done: impl Fn() -> bool) {
    let start = Instant::now();
    let report_interval = Duration::from_secs(1);
    let mut last_report = Instant::now();
    let mut last = Totals::load();
    let mut last_histogram: Option<Histogram> = metrics::PUBLISH_LATENCY.load();

    eprintln!("running for {:?}...", config.general.duration);
    print_header();

    while shared.is_running() && !writer_done() && start.elapsed() < config.general.duration {
        thread::sleep(Duration::from_millis(100));

        if last_report.elapsed() < report_interval {
            continue;
        }

        let now = Totals::load();
        let secs = last_report.elapsed().as_secs_f64();
        let rate = |cur: u64, prev: u64| (cur - prev) as f64 / secs;

        let current_histogram = metrics::PUBLISH_LATENCY.load();
        let (p50, p99, max) = match (&current_histogram, &last_histogram) {
            (Some(current), Some(previous)) => match current.wrapping_sub(previous) {
                Ok(delta) => (
                    percentile_from_histogram(&delta, 50.0),
                    percentile_from_histogram(&delta, 99.0),
                    percentile_from_histogram(&delta, 100.0),
                ),
                Err(_) => (0.0, 0.0, 0.0),
            },
            (Some(current), None) => (
                percentile_from_histogram(current, 50.0),
                percentile_from_histogram(current, 99.0),
                percentile_from_histogram(current, 100.0),
            ),
            _ => (0.0, 0.0, 0.0),
        };

        println!(
            "{:>12.0} {:>10.1} {:>12.0} {:>10.0} {:>10.0} {:>10.0} {:>10.0} {:>10.0}",
            rate(now.published, last.published),
            rate(now.bytes, last.bytes) / 1e6,
            rate(now.reads, last.reads),
            rate(now.overruns, last.overruns),
            rate(now.aborted, last.aborted),
            p50,
            p99,
            max,
        );

        last = now;
        last_histogram = current_histogram;
        last_report = Instant::now();
    }
}

fn print_config(config: &Config) {
    eprintln!("reasm-bench configuration:");
    eprintln!("  depth:      {}", config.pool.depth);
    eprintln!("  burst:      {}", config.pool.burst);
    eprintln!("  origin:     {}", config.pool.origin);
    eprintln!("  hugepages:  {:?}", config.pool.hugepages);
    eprintln!("  consumers:  {}", config.general.consumers);
    eprintln!("  duration:   {:?}", config.general.duration);
    eprintln!("  streams:    {}", config.workload.streams);
    eprintln!(
        "  messages:   {}..={} bytes in {} byte fragments{}",
        config.workload.message.min,
        config.workload.message.max,
        config.workload.fragment_size,
        if config.oversized_messages() {
            " (some oversized)"
        } else {
            ""
        },
    );
    eprintln!(
        "  faults:     duplicate={}% loss={}% abandon={}%",
        config.workload.duplicate, config.workload.loss, config.workload.abandon,
    );
    eprintln!();
}

fn print_header() {
    println!(
        "{:>12} {:>10} {:>12} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "msgs/sec", "MB/sec", "reads/sec", "overrun/s", "abort/s", "p50(ns)", "p99(ns)", "max(ns)",
    );
    println!("{}", "-".repeat(96));
}

fn print_summary(config: &Config, pool: &PoolMetrics) {
    let published = metrics::MESSAGES_PUBLISHED.value();
    let elapsed = config.general.duration.as_secs_f64();
    let avg_rate = if elapsed > 0.0 {
        published as f64 / elapsed
    } else {
        0.0
    };

    eprintln!();
    eprintln!("=== Final Summary ===");
    eprintln!("  published:        {published} ({avg_rate:.0}/sec)");
    eprintln!("  bytes:            {}", metrics::BYTES_PUBLISHED.value());
    eprintln!("  fragments:        {}", metrics::FRAGMENTS_APPENDED.value());
    eprintln!(
        "  duplicates:       {}",
        metrics::FRAGMENTS_ALREADY_COVERED.value()
    );
    eprintln!(
        "  aborted:          skipped={} too_large={} abandoned={} evicted={}",
        metrics::MESSAGES_SKIPPED.value(),
        metrics::MESSAGES_TOO_LARGE.value(),
        metrics::MESSAGES_ABANDONED.value(),
        metrics::MESSAGES_EVICTED.value(),
    );
    eprintln!("  corruption:       {}", metrics::CORRUPTION_RESETS.value());
    eprintln!(
        "  consumer reads:   {} (overruns: {}, errors: {})",
        metrics::CONSUMER_READS.value(),
        metrics::CONSUMER_OVERRUNS.value(),
        metrics::CONSUMER_ERRORS.value(),
    );
    eprintln!(
        "  pool slots:       free={} busy={} published={} (burst utilization {:.1}%)",
        pool.free,
        pool.busy,
        pool.published,
        pool.burst_utilization(),
    );
    eprintln!();

    print_latency_summary("PUBLISH", &metrics::PUBLISH_LATENCY);
}

fn print_latency_summary(label: &str, hist: &AtomicHistogram) {
    let Some(snapshot) = hist.load() else {
        return;
    };
    let p50 = percentile_from_histogram(&snapshot, 50.0);
    let p90 = percentile_from_histogram(&snapshot, 90.0);
    let p99 = percentile_from_histogram(&snapshot, 99.0);
    let p999 = percentile_from_histogram(&snapshot, 99.9);
    let max = percentile_from_histogram(&snapshot, 100.0);

    eprintln!(
        "  {label:<8} latency (ns): p50={p50:.0}  p90={p90:.0}  p99={p99:.0}  p999={p999:.0}  max={max:.0}",
    );
}

fn percentile_from_histogram(hist: &Histogram, p: f64) -> f64 {
    if let Ok(Some(results)) = hist.percentiles(&[p])
        && let Some((_pct, bucket)) = results.first()
    {
        return bucket.end() as f64;
    }
    0.0
}

// --- CPU pinning ---

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu_id: usize) -> std::io::Result<()> {
    use std::mem;

    unsafe {
        let mut cpuset: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu_id, &mut cpuset);

        let result = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpuset);

        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu_id: usize) -> std::io::Result<()> {
    Ok(())
}
