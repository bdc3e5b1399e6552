use crate::error::{PipelineError, Result};
use crate::topology::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Stage-level retry policy applied by the orchestration layer.
///
/// Transient stage failures are retried up to `max_attempts` with a fixed
/// backoff before the whole run is marked failed.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(300),
        }
    }
}

/// Run state (one end-to-end answer to one user question).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunState {
    Queued {
        queued_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        current_stage: StageId,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        answer: String,
        /// Stages short-circuited by the expert branch, reported explicitly.
        skipped_stages: Vec<StageId>,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
        failed_stage: StageId,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    },
}

impl RunState {
    pub fn state_name(&self) -> &'static str {
        match self {
            RunState::Queued { .. } => "queued",
            RunState::Running { .. } => "running",
            RunState::Completed { .. } => "completed",
            RunState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed { .. } | RunState::Failed { .. })
    }
}

/// Run model.
#[derive(Debug, Clone)]
pub struct Run {
    pub id: Uuid,
    pub user_question: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new_queued(user_question: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_question,
            state: RunState::Queued { queued_at: now },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Run state machine for transitions.
pub struct RunStateMachine {
    run: Run,
    retry: RetryPolicy,
}

impl RunStateMachine {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(run: Run, retry: RetryPolicy) -> Self {
        Self { run, retry }
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn into_run(self) -> Run {
        self.run
    }

    /// Transition: QUEUED -> RUNNING
    pub fn start(&mut self, current_stage: StageId) -> Result<()> {
        match &self.run.state {
            RunState::Queued { .. } => {
                let now = Utc::now();
                self.run.state = RunState::Running {
                    started_at: now,
                    current_stage,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("running")),
        }
    }

    /// Update current stage for a running run.
    pub fn update_stage(&mut self, stage: StageId) -> Result<()> {
        match &mut self.run.state {
            RunState::Running { current_stage, .. } => {
                *current_stage = stage;
                self.run.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid_transition("update_stage")),
        }
    }

    /// Transition: RUNNING -> COMPLETED
    ///
    /// Branch-driven early termination is a completion, never a failure:
    /// skipped stages are carried as an explicit marker on the final state.
    pub fn complete(&mut self, answer: String, skipped_stages: Vec<StageId>) -> Result<()> {
        match &self.run.state {
            RunState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.run.state = RunState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms,
                    answer,
                    skipped_stages,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("completed")),
        }
    }

    /// Transition: RUNNING -> FAILED
    ///
    /// While attempts remain, a fixed-backoff retry slot is scheduled.
    pub fn fail(&mut self, error: String, failed_stage: StageId, retry_count: u32) -> Result<()> {
        match &self.run.state {
            RunState::Running { started_at, .. } | RunState::Failed { started_at, .. } => {
                let now = Utc::now();
                let next_retry_at = if retry_count < self.retry.max_attempts {
                    Some(now + chrono::Duration::from_std(self.retry.backoff).unwrap_or_default())
                } else {
                    None
                };
                self.run.state = RunState::Failed {
                    started_at: *started_at,
                    failed_at: now,
                    error,
                    failed_stage,
                    retry_count,
                    next_retry_at,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("failed")),
        }
    }

    /// Transition: FAILED -> QUEUED (retry)
    pub fn retry(&mut self) -> Result<()> {
        match &self.run.state {
            RunState::Failed { next_retry_at, .. } => {
                if next_retry_at.is_none() {
                    return Err(PipelineError::Config(
                        "no retry scheduled (max attempts exceeded)".to_string(),
                    ));
                }
                let now = Utc::now();
                self.run.state = RunState::Queued { queued_at: now };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("queued (retry)")),
        }
    }

    fn invalid_transition(&self, to: &str) -> PipelineError {
        PipelineError::InvalidStateTransition {
            from: self.run.state.state_name().to_string(),
            to: to.to_string(),
        }
    }
}
