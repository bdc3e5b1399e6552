use crate::topology::StageId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology build error: {0}")]
    TopologyBuild(String),

    #[error("DAG cycle detected")]
    DagCycleDetected,

    #[error("Malformed validation output: {0}")]
    BranchDecode(String),

    #[error("Unknown validation status: {0}")]
    UnknownValidationStatus(String),

    #[error("Stage {stage} failed: {cause}")]
    StageExecution { stage: StageId, cause: String },

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Duplicate result for stage: {0}")]
    DuplicateResult(StageId),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Config(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    pub fn stage<E: std::fmt::Display>(stage: StageId, cause: E) -> Self {
        Self::StageExecution {
            stage,
            cause: cause.to_string(),
        }
    }

    /// Whether the orchestration layer may retry the failed stage call.
    ///
    /// Only transient network-boundary failures qualify; configuration,
    /// topology, and branch-decoding errors are fatal to the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::StageExecution { .. }
                | PipelineError::Timeout(_)
                | PipelineError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::stage(StageId::Rerank, "connection refused").is_retryable());
        assert!(PipelineError::Timeout("rerank timed out".to_string()).is_retryable());

        assert!(!PipelineError::Config("missing user_question".to_string()).is_retryable());
        assert!(!PipelineError::BranchDecode("not an object".to_string()).is_retryable());
        assert!(!PipelineError::UnknownValidationStatus("PARTIAL".to_string()).is_retryable());
        assert!(!PipelineError::MissingDependency("rerank".to_string()).is_retryable());
    }

    #[test]
    fn test_stage_error_carries_stage_id() {
        let err = PipelineError::stage(StageId::SimilarityRetrieve, "boom");
        assert_eq!(
            err.to_string(),
            "Stage similarity_retrieval failed: boom"
        );
    }
}
