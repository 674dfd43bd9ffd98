//! Write path metrics
//!
//! One [`WriteMetrics`] holder is owned by the writer pool and shared with
//! its workers. Counters are plain atomics; callers only see read accessors
//! and [`WriteMetrics::snapshot`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Default tick of the write rate meter
pub const DEFAULT_RATE_TICK: Duration = Duration::from_secs(5);

/// Window the write rate is averaged over
const RATE_WINDOW_SECS: f64 = 60.0;

// =============================================================================
// Rate meter
// =============================================================================

#[derive(Debug)]
struct RateState {
    uncounted: u64,
    rate: f64,
    initialized: bool,
    last_tick: Instant,
}

/// One-minute exponentially weighted moving average of an event rate
///
/// Events are accumulated and folded into the average once per tick, the
/// same way load averages are computed.
#[derive(Debug)]
pub struct RateMeter {
    tick: Duration,
    alpha: f64,
    state: Mutex<RateState>,
}

impl RateMeter {
    /// Create a meter with the given tick interval
    pub fn new(tick: Duration) -> Self {
        let tick = tick.max(Duration::from_millis(1));
        Self {
            tick,
            alpha: 1.0 - (-tick.as_secs_f64() / RATE_WINDOW_SECS).exp(),
            state: Mutex::new(RateState {
                uncounted: 0,
                rate: 0.0,
                initialized: false,
                last_tick: Instant::now(),
            }),
        }
    }

    /// Record `count` events
    pub fn mark(&self, count: u64) {
        let mut state = self.state.lock();
        self.tick_if_needed(&mut state);
        state.uncounted = state.uncounted.saturating_add(count);
    }

    /// Current rate in events per second
    pub fn rate(&self) -> f64 {
        let mut state = self.state.lock();
        self.tick_if_needed(&mut state);
        state.rate
    }

    fn tick_if_needed(&self, state: &mut RateState) {
        let elapsed = state.last_tick.elapsed();
        let ticks = (elapsed.as_nanos() / self.tick.as_nanos()) as u64;
        if ticks == 0 {
            return;
        }
        state.last_tick += self.tick * ticks.min(u32::MAX as u64) as u32;

        let instant = state.uncounted as f64 / self.tick.as_secs_f64();
        state.uncounted = 0;
        if state.initialized {
            state.rate += self.alpha * (instant - state.rate);
        } else {
            state.rate = instant;
            state.initialized = true;
        }

        // Remaining ticks saw no events
        let idle = (ticks - 1).min(i32::MAX as u64) as i32;
        if idle > 0 {
            state.rate *= (1.0 - self.alpha).powi(idle);
        }
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_TICK)
    }
}

// =============================================================================
// Write metrics
// =============================================================================

/// Metrics of the asynchronous write path
#[derive(Debug)]
pub struct WriteMetrics {
    /// Values accepted into the queue
    enqueued: AtomicU64,
    /// Values durably written
    written: AtomicU64,
    /// Values discarded by the overflow policy
    dropped: AtomicU64,
    /// Values refused by the overflow policy
    rejected: AtomicU64,
    /// Values lost to failed batch inserts
    failed: AtomicU64,
    /// Batch inserts issued
    batches: AtomicU64,
    /// Batch inserts that failed
    failed_batches: AtomicU64,
    /// Values queued or in flight
    queue_depth: AtomicUsize,
    /// Workers currently inside a backend batch insert
    active_writers: AtomicUsize,
    write_rate: RateMeter,
}

impl WriteMetrics {
    /// Create a metrics holder with the default rate tick
    pub fn new() -> Self {
        Self::with_rate_tick(DEFAULT_RATE_TICK)
    }

    /// Create a metrics holder whose rate meter ticks every `tick`
    pub fn with_rate_tick(tick: Duration) -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            queue_depth: AtomicUsize::new(0),
            active_writers: AtomicUsize::new(0),
            write_rate: RateMeter::new(tick),
        }
    }

    // === Recording ===

    #[inline]
    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo an enqueue whose value never reached a worker
    #[inline]
    pub(crate) fn record_unqueued(&self) {
        self.enqueued.fetch_sub(1, Ordering::Relaxed);
        self.queue_depth.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_rejected(&self, count: u64) {
        self.rejected.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a completed batch insert
    pub(crate) fn record_batch(&self, size: usize, ok: bool) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.written.fetch_add(size as u64, Ordering::Relaxed);
            self.write_rate.mark(size as u64);
        } else {
            self.failed.fetch_add(size as u64, Ordering::Relaxed);
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
        }
        self.queue_depth.fetch_sub(size, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn writer_started(&self) {
        self.active_writers.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn writer_finished(&self) {
        self.active_writers.fetch_sub(1, Ordering::SeqCst);
    }

    // === Accessors ===

    /// Values accepted into the queue
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Values durably written
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Values discarded by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Values refused by the overflow policy
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Values lost to failed batch inserts
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Batch inserts issued
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Values queued or being written
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    /// Workers currently writing
    pub fn active_writers(&self) -> usize {
        self.active_writers.load(Ordering::SeqCst)
    }

    /// One-minute average of values written per second
    pub fn write_rate(&self) -> f64 {
        self.write_rate.rate()
    }

    /// Point-in-time copy of all metrics
    pub fn snapshot(&self) -> WriteMetricsSnapshot {
        WriteMetricsSnapshot {
            enqueued: self.enqueued(),
            written: self.written(),
            dropped: self.dropped(),
            rejected: self.rejected(),
            failed: self.failed(),
            batches: self.batches(),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            active_writers: self.active_writers(),
            write_rate: self.write_rate(),
        }
    }
}

impl Default for WriteMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of [`WriteMetrics`] at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteMetricsSnapshot {
    /// Values accepted into the queue
    pub enqueued: u64,
    /// Values durably written
    pub written: u64,
    /// Values discarded by the overflow policy
    pub dropped: u64,
    /// Values refused by the overflow policy
    pub rejected: u64,
    /// Values lost to failed batch inserts
    pub failed: u64,
    /// Batch inserts issued
    pub batches: u64,
    /// Batch inserts that failed
    pub failed_batches: u64,
    /// Values queued or being written
    pub queue_depth: usize,
    /// Workers currently writing
    pub active_writers: usize,
    /// Values written per second (one-minute average)
    pub write_rate: f64,
}
