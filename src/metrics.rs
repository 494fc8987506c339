use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-stage metrics collector.
///
/// Counters are monotonically nondecreasing and shared atomically among a
/// stage's workers. The `started_at`/`stopped_at` timestamps bracket the
/// measurement window: `start` latches at worker spawn and `stop` latches
/// when the first worker of the stage exits. Both are write-once; repeated
/// calls never move them.
#[derive(Debug)]
pub struct StageMetrics {
    generated_items: AtomicU64,
    processed_items: AtomicU64,
    output_items: AtomicU64,
    dropped_items: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    stopped_at: Mutex<Option<Instant>>,
}

impl StageMetrics {
    pub fn new() -> Self {
        Self {
            generated_items: AtomicU64::new(0),
            processed_items: AtomicU64::new(0),
            output_items: AtomicU64::new(0),
            dropped_items: AtomicU64::new(0),
            started_at: Mutex::new(None),
            stopped_at: Mutex::new(None),
        }
    }

    /// Record one generated item (generator stages)
    pub fn record_generated(&self) {
        self.generated_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a burst of generated items
    pub fn record_generated_batch(&self, n: u64) {
        self.generated_items.fetch_add(n, Ordering::Relaxed);
    }

    /// Record one successfully processed item
    pub fn record_processed(&self) {
        self.processed_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one item placed on the output buffer
    pub fn record_output(&self) {
        self.output_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one dropped item
    pub fn record_dropped(&self) {
        self.dropped_items.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a burst of dropped items
    pub fn record_dropped_batch(&self, n: u64) {
        self.dropped_items.fetch_add(n, Ordering::Relaxed);
    }

    /// Mark the start of the measurement window. Latching: only the first
    /// call takes effect.
    pub fn start(&self) {
        let mut started = self.started_at.lock();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    /// Mark the end of the measurement window. Latching: only the first
    /// call takes effect.
    pub fn stop(&self) {
        let mut stopped = self.stopped_at.lock();
        if stopped.is_none() {
            *stopped = Some(Instant::now());
        }
    }

    pub fn total_generated(&self) -> u64 {
        self.generated_items.load(Ordering::Relaxed)
    }

    pub fn total_processed(&self) -> u64 {
        self.processed_items.load(Ordering::Relaxed)
    }

    pub fn total_output(&self) -> u64 {
        self.output_items.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped_items.load(Ordering::Relaxed)
    }

    /// The measurement window so far. `stopped_at` is treated as "now"
    /// until it latches; zero before `start`.
    pub fn elapsed(&self) -> Duration {
        let started = match *self.started_at.lock() {
            Some(t) => t,
            None => return Duration::ZERO,
        };
        let stopped = (*self.stopped_at.lock()).unwrap_or_else(Instant::now);
        stopped.saturating_duration_since(started)
    }

    /// Output items per second over the measurement window; zero when the
    /// window is empty.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_output() as f64 / secs
    }

    /// Dropped items over the stage's own denominator: `generated` when the
    /// stage generated anything, `processed` otherwise. Zero denominator
    /// yields zero.
    pub fn drop_rate(&self) -> f64 {
        let generated = self.total_generated();
        let denom = if generated > 0 {
            generated
        } else {
            self.total_processed()
        };
        if denom == 0 {
            return 0.0;
        }
        self.total_dropped() as f64 / denom as f64
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            generated_items: self.total_generated(),
            processed_items: self.total_processed(),
            output_items: self.total_output(),
            dropped_items: self.total_dropped(),
            drop_rate: self.drop_rate(),
            throughput: self.throughput(),
            elapsed: self.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of one stage's metrics at a point in time.
///
/// Field names follow the stable metric names used by the reporters:
/// `generated_items`, `processed_items`, `output_items`, `dropped_items`,
/// `drop_rate`, `throughput`. Counts a stage never touches read as zero.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub generated_items: u64,
    pub processed_items: u64,
    pub output_items: u64,
    pub dropped_items: u64,
    pub drop_rate: f64,
    pub throughput: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Generated: {}, Processed: {}, Output: {}, Dropped: {}, \
             Drop Rate: {:.2}%, Throughput: {:.2} items/s, Elapsed: {:.2}s",
            self.generated_items,
            self.processed_items,
            self.output_items,
            self.dropped_items,
            self.drop_rate * 100.0,
            self.throughput,
            self.elapsed.as_secs_f64()
        )
    }
}
