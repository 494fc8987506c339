use crate::error::WorkerError;
use std::sync::Arc;
use std::time::Duration;

/// Closure that synthesizes one item (generator stages).
pub type GeneratorFn<T> = Arc<dyn Fn() -> T + Send + Sync>;

/// Closure that synthesizes a burst of items (generator stages).
pub type BurstFn<T> = Arc<dyn Fn() -> Vec<T> + Send + Sync>;

/// Closure that maps an input item to an output item, fallibly.
///
/// The input is borrowed so that the engine can retry the same item without
/// requiring `T: Clone`.
pub type WorkerFn<T> = Arc<dyn Fn(&T) -> Result<T, WorkerError> + Send + Sync>;

/// Configuration for a pipeline stage.
///
/// Fields are public and may be set directly; the `with_*` helpers exist for
/// chained construction. Which functions are required depends on the stage's
/// position in the pipeline: the first stage needs `generator_fn`, interior
/// stages need `worker_fn`, and the last stage (the sink) needs neither:
/// the sink reads and discards, and any `worker_fn` set on it is ignored.
pub struct StageConfig<T> {
    /// Number of concurrent workers
    pub worker_count: usize,
    /// Capacity of the stage's output buffer (0 = rendezvous)
    pub buffer_capacity: usize,
    /// Minimum spacing between generated items, per worker (generator only)
    pub generation_interval: Duration,
    /// Synthetic delay applied before every processing attempt
    pub worker_delay: Duration,
    /// Additional attempts after the first failure before an item drops
    pub retry_budget: u32,
    /// Drop instead of blocking when the output buffer is full
    pub drop_on_backpressure: bool,
    /// Item source (required for the generator stage)
    pub generator_fn: Option<GeneratorFn<T>>,
    /// Item transform (required for interior stages)
    pub worker_fn: Option<WorkerFn<T>>,
    /// Burst source; when set together with `burst_total`, the generator
    /// interleaves bursts with regular generation
    pub burst_fn: Option<BurstFn<T>>,
    /// Minimum spacing between bursts
    pub burst_interval: Duration,
    /// Maximum number of bursts (0 disables bursting)
    pub burst_total: u32,
}

impl<T> StageConfig<T> {
    pub fn new() -> Self {
        Self {
            worker_count: 1,
            buffer_capacity: 1,
            generation_interval: Duration::ZERO,
            worker_delay: Duration::ZERO,
            retry_budget: 0,
            drop_on_backpressure: false,
            generator_fn: None,
            worker_fn: None,
            burst_fn: None,
            burst_interval: Duration::ZERO,
            burst_total: 0,
        }
    }

    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_buffer(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_generation_interval(mut self, interval: Duration) -> Self {
        self.generation_interval = interval;
        self
    }

    pub fn with_worker_delay(mut self, delay: Duration) -> Self {
        self.worker_delay = delay;
        self
    }

    pub fn with_retry_budget(mut self, retries: u32) -> Self {
        self.retry_budget = retries;
        self
    }

    pub fn with_drop_on_backpressure(mut self, drop: bool) -> Self {
        self.drop_on_backpressure = drop;
        self
    }

    pub fn with_generator<F>(mut self, f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.generator_fn = Some(Arc::new(f));
        self
    }

    pub fn with_worker<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> Result<T, WorkerError> + Send + Sync + 'static,
    {
        self.worker_fn = Some(Arc::new(f));
        self
    }

    pub fn with_bursts<F>(mut self, f: F, interval: Duration, total: u32) -> Self
    where
        F: Fn() -> Vec<T> + Send + Sync + 'static,
    {
        self.burst_fn = Some(Arc::new(f));
        self.burst_interval = interval;
        self.burst_total = total;
        self
    }
}

impl<T> Default for StageConfig<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for StageConfig<T> {
    fn clone(&self) -> Self {
        Self {
            worker_count: self.worker_count,
            buffer_capacity: self.buffer_capacity,
            generation_interval: self.generation_interval,
            worker_delay: self.worker_delay,
            retry_budget: self.retry_budget,
            drop_on_backpressure: self.drop_on_backpressure,
            generator_fn: self.generator_fn.clone(),
            worker_fn: self.worker_fn.clone(),
            burst_fn: self.burst_fn.clone(),
            burst_interval: self.burst_interval,
            burst_total: self.burst_total,
        }
    }
}

impl<T> std::fmt::Debug for StageConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageConfig")
            .field("worker_count", &self.worker_count)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("generation_interval", &self.generation_interval)
            .field("worker_delay", &self.worker_delay)
            .field("retry_budget", &self.retry_budget)
            .field("drop_on_backpressure", &self.drop_on_backpressure)
            .field("generator_fn", &self.generator_fn.is_some())
            .field("worker_fn", &self.worker_fn.is_some())
            .field("burst_fn", &self.burst_fn.is_some())
            .field("burst_interval", &self.burst_interval)
            .field("burst_total", &self.burst_total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: StageConfig<u64> = StageConfig::default();
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.buffer_capacity, 1);
        assert_eq!(config.retry_budget, 0);
        assert!(!config.drop_on_backpressure);
        assert!(config.generator_fn.is_none());
        assert!(config.worker_fn.is_none());
    }

    #[test]
    fn test_builder_helpers() {
        let config: StageConfig<u64> = StageConfig::new()
            .with_workers(4)
            .with_buffer(64)
            .with_retry_budget(2)
            .with_drop_on_backpressure(true)
            .with_worker(|item| Ok(*item));

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.retry_budget, 2);
        assert!(config.drop_on_backpressure);
        assert!(config.worker_fn.is_some());
    }

    #[test]
    fn test_clone_shares_closures() {
        let config: StageConfig<u64> = StageConfig::new().with_generator(|| 7);
        let generator = config.clone().generator_fn.unwrap();
        assert_eq!(generator.as_ref()(), 7);
    }
}
