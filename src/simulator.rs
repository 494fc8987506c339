use crate::cancel::CancelHandle;
use crate::error::{Result, SimulatorError};
use crate::report::{self, Presentation};
use crate::stage::{Role, Stage};
use crossbeam::channel::after;
use crossbeam::select;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// A concurrent pipeline simulator that orchestrates an ordered chain of
/// processing stages.
///
/// The first added stage is the generator, the last is the sink, and
/// everything in between is an interior stage; a pipeline therefore needs at
/// least three stages. `start` wires each stage's output to the next stage's
/// input, runs the whole chain under the configured wall-clock duration, and
/// blocks until every worker has departed, after which all metrics snapshots
/// are stable.
pub struct Simulator<T> {
    duration: Duration,
    stages: Vec<Stage<T>>,
    cancel: CancelHandle,
}

impl<T: Send + 'static> Simulator<T> {
    pub fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            stages: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    /// Set the wall-clock budget. Zero (the default) means the simulation
    /// runs until an external [`Simulator::stop`]; with neither, `start`
    /// blocks indefinitely.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Append a stage to the pipeline. Names must be non-empty and unique.
    pub fn add_stage(&mut self, stage: Stage<T>) -> Result<()> {
        if stage.name().is_empty() {
            return Err(SimulatorError::EmptyStageName);
        }
        if self.stages.iter().any(|s| s.name() == stage.name()) {
            return Err(SimulatorError::DuplicateStage(stage.name().to_owned()));
        }
        self.stages.push(stage);
        Ok(())
    }

    /// Run the simulation and block until it completes, then emit the chosen
    /// report.
    ///
    /// Assigns roles by position, wires adjacent stages, validates every
    /// stage before spawning any worker, and injects the shared cancellation
    /// token. Once this returns, no worker task is still runnable and every
    /// stage's metrics are final.
    pub fn start(&mut self, presentation: Presentation) -> Result<()> {
        if self.stages.len() < 3 {
            return Err(SimulatorError::TooFewStages(self.stages.len()));
        }

        let last = self.stages.len() - 1;
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let role = match i {
                0 => Role::Generator,
                i if i == last => Role::Sink,
                _ => Role::Interior,
            };
            stage.set_role(role);
        }

        for i in 0..last {
            let output = self.stages[i]
                .take_output_rx()
                .ok_or_else(|| SimulatorError::UnwiredStage(self.stages[i].name().to_owned()))?;
            self.stages[i + 1].set_input(output);
        }

        for stage in &self.stages {
            stage.validate()?;
        }

        info!(
            stages = self.stages.len(),
            duration = ?self.duration,
            "starting pipeline simulation"
        );

        let token = self.cancel.token();
        let mut workers = Vec::new();
        for stage in &mut self.stages {
            match stage.spawn(&token) {
                Ok(handles) => workers.extend(handles),
                Err(err) => {
                    // Unwind whatever was already spawned before surfacing
                    // the error.
                    self.cancel.cancel();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        let timer = if self.duration.is_zero() {
            None
        } else {
            let handle = self.cancel.clone();
            let token = self.cancel.token();
            let duration = self.duration;
            Some(thread::spawn(move || {
                select! {
                    recv(token.receiver()) -> _ => {}
                    recv(after(duration)) -> _ => {
                        info!("duration elapsed, cancelling pipeline");
                        handle.cancel();
                    }
                }
            }))
        };

        // Joining every worker is the quit condition: start returns no
        // earlier than the last worker departs.
        for handle in workers {
            let _ = handle.join();
        }
        self.cancel.cancel();
        if let Some(timer) = timer {
            let _ = timer.join();
        }
        debug!("all workers departed");

        report::render(&report::collect(&self.stages), presentation)
    }

    /// Trigger cancellation. Idempotent; safe to call before, during, or
    /// after `start`.
    pub fn stop(&self) {
        info!("stop requested");
        self.cancel.cancel();
    }

    /// A handle that can stop the simulation from another thread while
    /// `start` blocks.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Read-only access to the stages, for reporters and test harnesses.
    pub fn stages(&self) -> &[Stage<T>] {
        &self.stages
    }

    /// Write the pipeline DOT graph for the current metrics to `path`.
    pub fn write_pipeline_dot(&self, path: impl AsRef<Path>) -> Result<()> {
        let dot = report::pipeline_dot(&report::collect(&self.stages));
        std::fs::write(path, dot)?;
        Ok(())
    }
}

impl<T: Send + 'static> Default for Simulator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable stop control detached from the simulator's lifetime.
#[derive(Clone)]
pub struct StopHandle {
    cancel: CancelHandle,
}

impl StopHandle {
    /// Trigger cancellation. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
