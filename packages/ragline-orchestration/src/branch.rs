use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::topology::StageId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

/// Validation verdict emitted by the expert-validation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "INCOMPLETE")]
    Incomplete,
}

/// Output contract of the expert-validation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    #[serde(default)]
    pub useful_information: String,
    #[serde(default)]
    pub missing_information: String,
}

// Status is decoded in two steps so a malformed payload and a well-formed
// payload with a foreign status surface as different errors.
#[derive(Deserialize)]
struct RawValidation {
    status: String,
    #[serde(default)]
    useful_information: String,
    #[serde(default)]
    missing_information: String,
}

impl ValidationOutcome {
    pub fn decode(value: &Value) -> Result<Self> {
        let raw: RawValidation = serde_json::from_value(value.clone())
            .map_err(|e| PipelineError::BranchDecode(e.to_string()))?;

        let status = match raw.status.as_str() {
            "COMPLETE" => ValidationStatus::Complete,
            "INCOMPLETE" => ValidationStatus::Incomplete,
            other => return Err(PipelineError::UnknownValidationStatus(other.to_string())),
        };

        Ok(Self {
            status,
            useful_information: raw.useful_information,
            missing_information: raw.missing_information,
        })
    }
}

/// Decision taken at the expert-branch junction, the only data-dependent
/// branch in the topology.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchDecision {
    /// The expert context already answers the question. Downstream
    /// retrieval, rerank, and evaluation stages are skipped; generation
    /// still runs in general mode. A successful early termination.
    Complete { expert_answer: String },
    /// Continue into the selected retrieval branch roots.
    Continue { selected: Vec<StageId> },
}

/// Evaluate the expert-validation output against the run configuration.
pub fn evaluate_branch(validation: &Value, config: &RunConfig) -> Result<BranchDecision> {
    let outcome = ValidationOutcome::decode(validation)?;

    match outcome.status {
        ValidationStatus::Complete => {
            info!(
                "Expert validation complete, skipping downstream retrieval: {}",
                outcome.useful_information
            );
            Ok(BranchDecision::Complete {
                expert_answer: outcome.useful_information,
            })
        }
        ValidationStatus::Incomplete => {
            let mut selected = Vec::new();
            if config.use_similarity {
                selected.push(StageId::SimilarityRetrieve);
            }
            if config.use_keyword {
                selected.push(StageId::KeywordExtract);
            }
            if selected.is_empty() {
                warn!("Expert validation incomplete but no retrieval branch enabled, continuing to generation");
            }
            Ok(BranchDecision::Continue { selected })
        }
    }
}
