use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Worker ids are unique for the life of the process, not just per tracker,
// so reports from different stages never alias.
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one worker within a [`BlockingTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

#[derive(Debug)]
struct WorkerRecord {
    opened_at: Instant,
    closed_at: Option<Instant>,
    total_blocked: Duration,
    by_site: BTreeMap<String, Duration>,
}

/// Measures, per worker, how much time is spent blocked at each named
/// suspension site.
///
/// Each stage owns one tracker. A worker opens itself once at spawn and
/// receives a [`WorkerHandle`]; all attribution goes through the handle, and
/// `close` consumes it, so recording against a departed worker is
/// unrepresentable. Distinct workers write to distinct records, so they
/// never contend with each other; snapshots are consistent per worker but
/// are not a global atomic cut across workers.
#[derive(Debug, Default)]
pub struct BlockingTracker {
    workers: Mutex<BTreeMap<WorkerId, Arc<Mutex<WorkerRecord>>>>,
}

impl BlockingTracker {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a new worker and return its handle.
    pub fn open_worker(&self) -> WorkerHandle {
        let id = WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(Mutex::new(WorkerRecord {
            opened_at: Instant::now(),
            closed_at: None,
            total_blocked: Duration::ZERO,
            by_site: BTreeMap::new(),
        }));
        self.workers.lock().insert(id, Arc::clone(&record));
        WorkerHandle { id, record }
    }

    /// A consistent per-worker view of all records.
    pub fn snapshot(&self) -> BTreeMap<WorkerId, WorkerStats> {
        let workers = self.workers.lock();
        workers
            .iter()
            .map(|(id, record)| {
                let record = record.lock();
                (
                    *id,
                    WorkerStats {
                        lifetime: record
                            .closed_at
                            .unwrap_or_else(Instant::now)
                            .saturating_duration_since(record.opened_at),
                        finished: record.closed_at.is_some(),
                        total_blocked: record.total_blocked,
                        by_site: record.by_site.clone(),
                    },
                )
            })
            .collect()
    }

    /// Number of workers ever opened on this tracker.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }
}

/// Write handle for one worker's record. Held exclusively by that worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    record: Arc<Mutex<WorkerRecord>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Attribute `elapsed` blocked time to `site` on this worker.
    pub fn record_block(&self, site: &str, elapsed: Duration) {
        let mut record = self.record.lock();
        record.total_blocked += elapsed;
        *record.by_site.entry(site.to_owned()).or_default() += elapsed;
    }

    /// Mark the worker finished. Consumes the handle: no further
    /// attribution to this worker is possible.
    pub fn close(self) {
        // Drop impl latches closed_at.
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let mut record = self.record.lock();
        if record.closed_at.is_none() {
            record.closed_at = Some(Instant::now());
        }
    }
}

/// Immutable view of one worker's blocked-time totals.
#[derive(Debug, Clone)]
pub struct WorkerStats {
    /// Time between open and close (or "now" while still running)
    pub lifetime: Duration,
    /// Whether the worker has departed
    pub finished: bool,
    /// Total time blocked across all sites
    pub total_blocked: Duration,
    /// Blocked time per suspension site
    pub by_site: BTreeMap<String, Duration>,
}

/// Stable site labels for one stage's suspension points.
#[derive(Debug, Clone)]
pub struct SiteLabels {
    pub recv: String,
    pub send_fast: String,
    pub send_block: String,
    pub send_drop: String,
    pub ctx_done: String,
}

impl SiteLabels {
    pub fn for_stage(name: &str) -> Self {
        Self {
            recv: format!("{name}.recv"),
            send_fast: format!("{name}.send.fast"),
            send_block: format!("{name}.send.block"),
            send_drop: format!("{name}.send.drop"),
            ctx_done: format!("{name}.ctx_done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_ids_are_unique() {
        let tracker = BlockingTracker::new();
        let a = tracker.open_worker();
        let b = tracker.open_worker();
        assert_ne!(a.id(), b.id());

        let other = BlockingTracker::new();
        let c = other.open_worker();
        assert_ne!(b.id(), c.id());
    }

    #[test]
    fn test_record_accumulates_per_site() {
        let tracker = BlockingTracker::new();
        let worker = tracker.open_worker();
        worker.record_block("s.recv", Duration::from_millis(5));
        worker.record_block("s.recv", Duration::from_millis(5));
        worker.record_block("s.send.block", Duration::from_millis(2));
        let id = worker.id();
        worker.close();

        let snapshot = tracker.snapshot();
        let stats = &snapshot[&id];
        assert_eq!(stats.total_blocked, Duration::from_millis(12));
        assert_eq!(stats.by_site["s.recv"], Duration::from_millis(10));
        assert_eq!(stats.by_site["s.send.block"], Duration::from_millis(2));
        assert!(stats.finished);
    }

    #[test]
    fn test_every_opened_worker_is_closed() {
        let tracker = BlockingTracker::new();
        {
            let worker = tracker.open_worker();
            worker.record_block("s.recv", Duration::from_millis(1));
            // Dropped without an explicit close, e.g. on a panic path.
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.values().all(|s| s.finished));
    }

    #[test]
    fn test_snapshot_sees_running_worker() {
        let tracker = BlockingTracker::new();
        let worker = tracker.open_worker();
        worker.record_block("s.recv", Duration::from_millis(3));

        let snapshot = tracker.snapshot();
        let stats = &snapshot[&worker.id()];
        assert!(!stats.finished);
        assert_eq!(stats.total_blocked, Duration::from_millis(3));
        worker.close();
    }

    #[test]
    fn test_site_labels() {
        let sites = SiteLabels::for_stage("Stage-1");
        assert_eq!(sites.recv, "Stage-1.recv");
        assert_eq!(sites.send_fast, "Stage-1.send.fast");
        assert_eq!(sites.send_block, "Stage-1.send.block");
        assert_eq!(sites.send_drop, "Stage-1.send.drop");
        assert_eq!(sites.ctx_done, "Stage-1.ctx_done");
    }
}
