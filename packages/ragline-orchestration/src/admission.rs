use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Admission-control limits enforced around the topology executor: a bound
/// on concurrent runs and a system-wide bound on concurrently executing
/// stage calls. External to any single run's logic.
#[derive(Clone)]
pub struct AdmissionController {
    runs: Arc<Semaphore>,
    stage_calls: Arc<Semaphore>,
}

pub struct RunPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct StageCallPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionController {
    pub fn new(max_runs: usize, max_stage_calls: usize) -> Self {
        Self {
            runs: Arc::new(Semaphore::new(max_runs)),
            stage_calls: Arc::new(Semaphore::new(max_stage_calls)),
        }
    }

    /// Block until a run slot is free; the permit is held for the run's
    /// whole lifetime.
    pub async fn admit_run(&self) -> RunPermit {
        // The semaphore is never closed.
        let permit = self
            .runs
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("run semaphore closed"));
        RunPermit { _permit: permit }
    }

    /// Block until a stage-call slot is free; held for one worker call.
    pub async fn admit_stage_call(&self) -> StageCallPermit {
        let permit = self
            .stage_calls
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("stage-call semaphore closed"));
        StageCallPermit { _permit: permit }
    }

    pub fn available_runs(&self) -> usize {
        self.runs.available_permits()
    }

    pub fn available_stage_calls(&self) -> usize {
        self.stage_calls.available_permits()
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(3, 6)
    }
}
