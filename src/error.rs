use thiserror::Error;

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimulatorError>;

/// Error type produced by user worker functions.
///
/// Worker failures never surface to the library caller; the engine accounts
/// them as drops (after the retry budget is exhausted).
pub type WorkerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while assembling or starting a pipeline.
///
/// These are all pre-start configuration errors. Once `start` begins
/// spawning workers, no further error is returned; runtime faults show up
/// only as drops in the metrics.
#[derive(Error, Debug)]
pub enum SimulatorError {
    /// Stage name is empty
    #[error("stage name cannot be empty")]
    EmptyStageName,

    /// A stage with the same name was already added
    #[error("repeated name not allowed: {0}")]
    DuplicateStage(String),

    /// The pipeline needs a generator, at least one interior stage, and a sink
    #[error("pipeline needs at least 3 stages, got {0}")]
    TooFewStages(usize),

    /// The first stage must carry a generator function
    #[error("generator function not set for stage {0}")]
    MissingGeneratorFn(String),

    /// Interior stages must carry a worker function
    #[error("worker function not set for stage {0}")]
    MissingWorkerFn(String),

    /// Every stage runs at least one worker
    #[error("worker count must be greater than 0 for stage {0}")]
    ZeroWorkers(String),

    /// A stage was spawned without being wired into a pipeline, or spawned
    /// twice. Only reachable through incorrect wiring.
    #[error("stage {0} is not wired into a pipeline")]
    UnwiredStage(String),

    /// Failed to write a report file
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
}
