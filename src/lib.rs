//! A staged concurrent pipeline simulator and profiler.
//!
//! This crate executes a user-defined chain of processing stages, each with
//! its own worker count, bounded output buffer, synthetic delays, retry
//! budget, and backpressure policy, under a wall-clock budget, and reports
//! per-stage throughput, drops, and per-worker blocked-time distributions.
//! It exists for experimentation: tune buffer sizes and worker counts
//! against a realistic workload shape and observe where latency and
//! contention accumulate.
//!
//! # Features
//!
//! - Bounded FIFO buffers between stages with per-stage block-or-drop
//!   backpressure policies
//! - Configurable worker multiplicity, generation rate, processing delay,
//!   and retry budget per stage
//! - Coordinated lifecycle: start, duration- or externally-driven
//!   cancellation, drain, single close, report
//! - Per-worker blocked-time tracking at every suspension site, aggregated
//!   into histograms
//! - Console summary tables and Graphviz DOT output
//!
//! # Example
//!
//! ```ignore
//! use flowsim::{Presentation, Simulator, Stage, StageConfig};
//! use std::time::Duration;
//!
//! let mut sim = Simulator::new();
//! sim.set_duration(Duration::from_secs(1));
//!
//! sim.add_stage(Stage::new(
//!     "generator",
//!     StageConfig::new()
//!         .with_generation_interval(Duration::from_millis(10))
//!         .with_generator(|| 7_u64),
//! ))?;
//! sim.add_stage(Stage::new(
//!     "double",
//!     StageConfig::new()
//!         .with_workers(4)
//!         .with_buffer(64)
//!         .with_worker(|item| Ok(item * 2)),
//! ))?;
//! sim.add_stage(Stage::new("sink", StageConfig::new()))?;
//!
//! sim.start(Presentation::Console)?;
//! ```
//!
//! Drops are a first-class outcome, not a failure: a full buffer under the
//! drop policy, an exhausted retry budget, or a cancelled blocking send all
//! account the item as dropped and show up in the metrics.

pub mod cancel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod report;
pub mod simulator;
pub mod stage;
pub mod tracker;

// Re-exports for convenience
pub use cancel::{CancelHandle, CancelToken};
pub use config::{BurstFn, GeneratorFn, StageConfig, WorkerFn};
pub use error::{Result, SimulatorError, WorkerError};
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use report::{Presentation, StageReport, PIPELINE_GRAPH_FILE};
pub use simulator::{Simulator, StopHandle};
pub use stage::{Role, Stage};
pub use tracker::{BlockingTracker, WorkerHandle, WorkerId, WorkerStats};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
