use crate::cancel::CancelToken;
use crate::config::{BurstFn, GeneratorFn, StageConfig, WorkerFn};
use crate::error::{Result, SimulatorError, WorkerError};
use crate::metrics::StageMetrics;
use crate::tracker::{BlockingTracker, SiteLabels, WorkerHandle};
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use crossbeam::select;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Position-derived role of a stage within the pipeline.
///
/// Assigned by the simulator at start: index 0 is the generator, the last
/// index is the sink, everything in between is interior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Generator,
    Interior,
    Sink,
}

/// A processing stage in the pipeline.
///
/// A stage owns its output buffer and runs `worker_count` identical workers
/// that either generate items (generator role) or consume from the previous
/// stage's output and produce into their own (interior role). The sink reads
/// and discards; it still owns an output buffer that nobody reads.
pub struct Stage<T> {
    name: String,
    config: StageConfig<T>,
    role: Role,
    input: Option<Receiver<T>>,
    output_tx: Option<Sender<T>>,
    output_rx: Option<Receiver<T>>,
    metrics: Arc<StageMetrics>,
    tracker: Arc<BlockingTracker>,
}

impl<T: Send + 'static> Stage<T> {
    /// Create a new stage with the given configuration.
    pub fn new(name: impl Into<String>, config: StageConfig<T>) -> Self {
        let (output_tx, output_rx) = bounded(config.buffer_capacity);
        Self {
            name: name.into(),
            config,
            role: Role::Interior,
            input: None,
            output_tx: Some(output_tx),
            output_rx: Some(output_rx),
            metrics: Arc::new(StageMetrics::new()),
            tracker: Arc::new(BlockingTracker::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StageConfig<T> {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The stage's metrics accumulator. Safe to read at any time; stable
    /// once `Simulator::start` has returned.
    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    /// The stage's blocked-time tracker.
    pub fn tracker(&self) -> &BlockingTracker {
        &self.tracker
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    pub(crate) fn take_output_rx(&mut self) -> Option<Receiver<T>> {
        self.output_rx.take()
    }

    pub(crate) fn set_input(&mut self, input: Receiver<T>) {
        self.input = Some(input);
    }

    /// Pre-spawn validation. Which functions are required depends on the
    /// role; capacities and budgets are unsigned and therefore cannot be
    /// negative.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SimulatorError::EmptyStageName);
        }
        if self.config.worker_count == 0 {
            return Err(SimulatorError::ZeroWorkers(self.name.clone()));
        }
        match self.role {
            Role::Generator if self.config.generator_fn.is_none() => {
                Err(SimulatorError::MissingGeneratorFn(self.name.clone()))
            }
            Role::Interior if self.config.worker_fn.is_none() => {
                Err(SimulatorError::MissingWorkerFn(self.name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Spawn the stage's workers. The master output sender is surrendered to
    /// the workers: when the last of them exits, the channel disconnects and
    /// the next stage observes end-of-input after draining.
    pub(crate) fn spawn(&mut self, cancel: &CancelToken) -> Result<Vec<JoinHandle<()>>> {
        self.metrics.start();

        let shared = Arc::new(WorkerShared {
            name: self.name.clone(),
            sites: SiteLabels::for_stage(&self.name),
            metrics: Arc::clone(&self.metrics),
            tracker: Arc::clone(&self.tracker),
            stop_latch: AtomicBool::new(false),
            worker_delay: self.config.worker_delay,
            retry_budget: self.config.retry_budget,
            drop_on_backpressure: self.config.drop_on_backpressure,
        });

        let output_tx = self
            .output_tx
            .take()
            .ok_or_else(|| SimulatorError::UnwiredStage(self.name.clone()))?;

        debug!(
            stage = %self.name,
            role = ?self.role,
            workers = self.config.worker_count,
            buffer = self.config.buffer_capacity,
            "spawning stage workers"
        );

        let mut handles = Vec::with_capacity(self.config.worker_count);
        match self.role {
            Role::Generator => {
                let generator = self
                    .config
                    .generator_fn
                    .clone()
                    .ok_or_else(|| SimulatorError::MissingGeneratorFn(self.name.clone()))?;
                let burst = self.burst_plan();
                let interval = self.config.generation_interval;
                for _ in 0..self.config.worker_count {
                    let shared = Arc::clone(&shared);
                    let generator = generator.clone();
                    let burst = burst.clone();
                    let output = output_tx.clone();
                    let cancel = cancel.clone();
                    handles.push(thread::spawn(move || {
                        run_generator(shared, generator, interval, burst, output, cancel);
                    }));
                }
            }
            Role::Interior | Role::Sink => {
                let input = self
                    .input
                    .take()
                    .ok_or_else(|| SimulatorError::UnwiredStage(self.name.clone()))?;
                // The sink reads and discards; any worker function on it is
                // ignored and consumed items are accounted as drops.
                let work = match self.role {
                    Role::Interior => self.config.worker_fn.clone(),
                    _ => None,
                };
                for _ in 0..self.config.worker_count {
                    let shared = Arc::clone(&shared);
                    let work = work.clone();
                    let input = input.clone();
                    let output = output_tx.clone();
                    let cancel = cancel.clone();
                    handles.push(thread::spawn(move || {
                        run_worker(shared, work, input, output, cancel);
                    }));
                }
            }
        }

        Ok(handles)
    }

    fn burst_plan(&self) -> Option<BurstPlan<T>> {
        let burst = self.config.burst_fn.clone()?;
        if self.config.burst_total == 0 {
            return None;
        }
        Some(BurstPlan {
            burst,
            interval: self.config.burst_interval,
            total: self.config.burst_total,
        })
    }
}

impl<T> std::fmt::Debug for Stage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("config", &self.config)
            .finish()
    }
}

/// State shared by all workers of one stage.
struct WorkerShared {
    name: String,
    sites: SiteLabels,
    metrics: Arc<StageMetrics>,
    tracker: Arc<BlockingTracker>,
    // Claimed by the first worker to exit; the claimant latches the metrics
    // stop so the measurement window ends when the stage starts winding down.
    stop_latch: AtomicBool,
    worker_delay: Duration,
    retry_budget: u32,
    drop_on_backpressure: bool,
}

impl WorkerShared {
    /// Send one ready item under the stage's backpressure policy.
    ///
    /// Non-blocking first: an immediately available slot is the fast path.
    /// On a full buffer the policy decides between dropping and blocking;
    /// a blocking send races the cancellation signal. A disconnected
    /// downstream (all of its workers departed) accounts exactly one drop.
    fn send_output<T>(
        &self,
        item: T,
        worker: &WorkerHandle,
        output: &Sender<T>,
        cancel: &CancelToken,
    ) {
        let start = Instant::now();
        match output.try_send(item) {
            Ok(()) => {
                self.metrics.record_output();
                worker.record_block(&self.sites.send_fast, start.elapsed());
            }
            Err(TrySendError::Disconnected(_)) => {
                self.metrics.record_dropped();
            }
            Err(TrySendError::Full(item)) => {
                if self.drop_on_backpressure {
                    self.metrics.record_dropped();
                    worker.record_block(&self.sites.send_drop, start.elapsed());
                    trace!(stage = %self.name, "output full, item dropped");
                    return;
                }
                select! {
                    recv(cancel.receiver()) -> _ => {
                        self.metrics.record_dropped();
                        worker.record_block(&self.sites.ctx_done, start.elapsed());
                    }
                    send(output, item) -> sent => {
                        match sent {
                            Ok(()) => {
                                self.metrics.record_output();
                                worker.record_block(&self.sites.send_block, start.elapsed());
                            }
                            Err(_) => self.metrics.record_dropped(),
                        }
                    }
                }
            }
        }
    }

    /// Per-worker exit path. Only one worker per stage claims the latch and
    /// stops the metrics clock; everyone else just departs. The worker's
    /// clone of the output sender drops with its thread, and the channel
    /// disconnects once the last clone is gone.
    fn terminate(&self, worker: WorkerHandle) {
        if self
            .stop_latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.metrics.stop();
            debug!(stage = %self.name, "measurement window closed");
        }
        worker.close();
    }
}

struct BurstPlan<T> {
    burst: BurstFn<T>,
    interval: Duration,
    total: u32,
}

impl<T> Clone for BurstPlan<T> {
    fn clone(&self) -> Self {
        Self {
            burst: self.burst.clone(),
            interval: self.interval,
            total: self.total,
        }
    }
}

fn run_generator<T: Send + 'static>(
    shared: Arc<WorkerShared>,
    generator: GeneratorFn<T>,
    interval: Duration,
    burst: Option<BurstPlan<T>>,
    output: Sender<T>,
    cancel: CancelToken,
) {
    let worker = shared.tracker.open_worker();
    let produce = generator.as_ref();
    let mut bursts_fired = 0u32;
    let mut last_burst = Instant::now();

    while !cancel.is_cancelled() {
        if let Some(plan) = &burst {
            if bursts_fired < plan.total && last_burst.elapsed() >= plan.interval {
                execute_burst(&shared, plan, &worker, &output, &cancel);
                bursts_fired += 1;
                last_burst = Instant::now();
                continue;
            }
        }

        if !interval.is_zero() {
            thread::sleep(interval);
        }

        match catch_unwind(AssertUnwindSafe(produce)) {
            Ok(item) => {
                shared.metrics.record_generated();
                shared.send_output(item, &worker, &output, &cancel);
            }
            Err(_) => {
                // The item existed only notionally; keep the generator
                // identity output + dropped = generated intact.
                shared.metrics.record_generated();
                shared.metrics.record_dropped();
                trace!(stage = %shared.name, "generator function panicked, item dropped");
            }
        }
    }

    shared.terminate(worker);
}

fn execute_burst<T: Send + 'static>(
    shared: &WorkerShared,
    plan: &BurstPlan<T>,
    worker: &WorkerHandle,
    output: &Sender<T>,
    cancel: &CancelToken,
) {
    let items = match catch_unwind(AssertUnwindSafe(plan.burst.as_ref())) {
        Ok(items) => items,
        Err(_) => {
            shared.metrics.record_generated();
            shared.metrics.record_dropped();
            return;
        }
    };

    shared.metrics.record_generated_batch(items.len() as u64);
    let mut remaining = items.into_iter();
    while let Some(item) = remaining.next() {
        if cancel.is_cancelled() {
            shared.metrics.record_dropped_batch(1 + remaining.len() as u64);
            return;
        }
        shared.send_output(item, worker, output, cancel);
    }
}

fn run_worker<T: Send + 'static>(
    shared: Arc<WorkerShared>,
    work: Option<WorkerFn<T>>,
    input: Receiver<T>,
    output: Sender<T>,
    cancel: CancelToken,
) {
    let worker = shared.tracker.open_worker();

    loop {
        let start = Instant::now();
        // Prefer draining buffered input over observing cancellation, for
        // higher measurement fidelity. Either resolution is correct when
        // both race.
        let item = match input.try_recv() {
            Ok(item) => {
                worker.record_block(&shared.sites.recv, start.elapsed());
                item
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                let received = select! {
                    recv(cancel.receiver()) -> _ => None,
                    recv(input) -> msg => msg.ok(),
                };
                worker.record_block(&shared.sites.recv, start.elapsed());
                match received {
                    Some(item) => item,
                    None => break,
                }
            }
        };
        trace!(stage = %shared.name, "item received from input");

        match &work {
            Some(work_fn) => {
                match process_with_retry(
                    work_fn,
                    &item,
                    shared.worker_delay,
                    shared.retry_budget,
                ) {
                    Ok(result) => {
                        shared.metrics.record_processed();
                        shared.send_output(result, &worker, &output, &cancel);
                    }
                    Err(err) => {
                        shared.metrics.record_dropped();
                        trace!(stage = %shared.name, error = %err, "item dropped after retries");
                    }
                }
            }
            None => {
                // Sink: read and discard. The simulated consumer still
                // honors the configured per-item delay.
                if !shared.worker_delay.is_zero() {
                    thread::sleep(shared.worker_delay);
                }
                shared.metrics.record_dropped();
            }
        }
    }

    shared.terminate(worker);
}

/// Run the user work function with the stage's retry policy: one initial
/// attempt plus `retry_budget` retries, each attempt preceded by
/// `worker_delay`. A panicking attempt counts as a failed attempt.
fn process_with_retry<T>(
    work: &WorkerFn<T>,
    item: &T,
    delay: Duration,
    retry_budget: u32,
) -> std::result::Result<T, WorkerError> {
    let call = work.as_ref();
    let mut attempt = 0u32;
    loop {
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let err = match catch_unwind(AssertUnwindSafe(|| call(item))) {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(err)) => err,
            Err(_) => WorkerError::from("worker function panicked"),
        };

        attempt += 1;
        if attempt > retry_budget {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_shared(drop_on_backpressure: bool) -> WorkerShared {
        WorkerShared {
            name: "test".into(),
            sites: SiteLabels::for_stage("test"),
            metrics: Arc::new(StageMetrics::new()),
            tracker: Arc::new(BlockingTracker::new()),
            stop_latch: AtomicBool::new(false),
            worker_delay: Duration::ZERO,
            retry_budget: 0,
            drop_on_backpressure,
        }
    }

    #[test]
    fn test_validate_generator_requires_generator_fn() {
        let mut stage: Stage<u64> = Stage::new("gen", StageConfig::default());
        stage.set_role(Role::Generator);
        assert!(matches!(
            stage.validate(),
            Err(SimulatorError::MissingGeneratorFn(_))
        ));
    }

    #[test]
    fn test_validate_interior_requires_worker_fn() {
        let stage: Stage<u64> = Stage::new("mid", StageConfig::default());
        assert!(matches!(
            stage.validate(),
            Err(SimulatorError::MissingWorkerFn(_))
        ));
    }

    #[test]
    fn test_validate_sink_requires_no_worker_fn() {
        let mut stage: Stage<u64> = Stage::new("sink", StageConfig::default());
        stage.set_role(Role::Sink);
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut stage: Stage<u64> =
            Stage::new("sink", StageConfig::default().with_workers(0));
        stage.set_role(Role::Sink);
        assert!(matches!(
            stage.validate(),
            Err(SimulatorError::ZeroWorkers(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let mut stage: Stage<u64> = Stage::new("", StageConfig::default());
        stage.set_role(Role::Sink);
        assert!(matches!(
            stage.validate(),
            Err(SimulatorError::EmptyStageName)
        ));
    }

    #[test]
    fn test_retry_succeeds_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let work: WorkerFn<u64> = Arc::new(move |item| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".into())
            } else {
                Ok(*item)
            }
        });

        let result = process_with_retry(&work, &7, Duration::ZERO, 2);
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let work: WorkerFn<u64> = Arc::new(move |item| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("transient".into())
            } else {
                Ok(*item)
            }
        });

        // One initial attempt plus one retry: still failing.
        let result = process_with_retry(&work, &7, Duration::ZERO, 1);
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_retry_budget_drops_on_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let work: WorkerFn<u64> = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("always".into())
        });

        assert!(process_with_retry(&work, &7, Duration::ZERO, 0).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_attempt_counts_against_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let work: WorkerFn<u64> = Arc::new(move |item| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            Ok(*item)
        });

        let result = process_with_retry(&work, &7, Duration::ZERO, 1);
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_send_output_fast_path() {
        let shared = test_shared(false);
        let worker = shared.tracker.open_worker();
        let (tx, rx) = bounded::<u64>(1);
        let cancel = crate::cancel::CancelHandle::new();

        shared.send_output(7, &worker, &tx, &cancel.token());
        assert_eq!(shared.metrics.total_output(), 1);
        assert_eq!(shared.metrics.total_dropped(), 0);
        assert_eq!(rx.try_recv().unwrap(), 7);
        worker.close();
    }

    #[test]
    fn test_send_output_drops_on_backpressure() {
        let shared = test_shared(true);
        let worker = shared.tracker.open_worker();
        let (tx, _rx) = bounded::<u64>(1);
        let cancel = crate::cancel::CancelHandle::new();
        let token = cancel.token();

        shared.send_output(1, &worker, &tx, &token);
        shared.send_output(2, &worker, &tx, &token);
        assert_eq!(shared.metrics.total_output(), 1);
        assert_eq!(shared.metrics.total_dropped(), 1);

        let id = worker.id();
        worker.close();
        let snapshot = shared.tracker.snapshot();
        assert!(snapshot[&id].by_site.contains_key("test.send.drop"));
    }

    #[test]
    fn test_send_output_cancelled_while_blocked() {
        let shared = test_shared(false);
        let worker = shared.tracker.open_worker();
        let (tx, _rx) = bounded::<u64>(1);
        let cancel = crate::cancel::CancelHandle::new();
        let token = cancel.token();

        shared.send_output(1, &worker, &tx, &token);
        cancel.cancel();
        // Buffer full and nobody reading: the cancel arm resolves the send.
        shared.send_output(2, &worker, &tx, &token);

        assert_eq!(shared.metrics.total_output(), 1);
        assert_eq!(shared.metrics.total_dropped(), 1);

        let id = worker.id();
        worker.close();
        let snapshot = shared.tracker.snapshot();
        assert!(snapshot[&id].by_site.contains_key("test.ctx_done"));
    }

    #[test]
    fn test_send_output_downstream_departed() {
        let shared = test_shared(false);
        let worker = shared.tracker.open_worker();
        let (tx, rx) = bounded::<u64>(1);
        drop(rx);
        let cancel = crate::cancel::CancelHandle::new();

        shared.send_output(1, &worker, &tx, &cancel.token());
        assert_eq!(shared.metrics.total_output(), 0);
        assert_eq!(shared.metrics.total_dropped(), 1);
        worker.close();
    }

    #[test]
    fn test_terminate_claims_stop_once() {
        let shared = test_shared(false);
        shared.metrics.start();
        let a = shared.tracker.open_worker();
        let b = shared.tracker.open_worker();

        shared.terminate(a);
        let stopped = shared.metrics.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        shared.terminate(b);
        assert_eq!(shared.metrics.elapsed(), stopped);

        let snapshot = shared.tracker.snapshot();
        assert!(snapshot.values().all(|s| s.finished));
    }
}
