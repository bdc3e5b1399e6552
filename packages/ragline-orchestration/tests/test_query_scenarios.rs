//! Integration tests for end-to-end query runs
//!
//! Exercises the topology executor over a scripted worker:
//! - Full dual-retrieval path with rerank
//! - Expert short-circuit (COMPLETE validation)
//! - Dual retrieval without rerank (merged generation context)
//! - Evaluation stage wiring
//! - Failure paths (retry exhaustion, unknown validation status)

use async_trait::async_trait;
use ragline_orchestration::{
    PipelineError, Result, RetryPolicy, Run, RunConfig, RunReport, RunState, StageId,
    StageInvoker, StageRequest, TopologyExecutor,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted worker: a canned result per stage, every request recorded.
struct ScriptedWorker {
    results: HashMap<StageId, Value>,
    failures: Mutex<HashMap<StageId, u32>>,
    requests: Mutex<Vec<(StageId, Value)>>,
}

impl ScriptedWorker {
    fn new() -> Self {
        let mut results = HashMap::new();
        results.insert(StageId::ExpertRetrieve, json!(["expert passage"]));
        results.insert(
            StageId::ExpertValidate,
            json!({
                "status": "INCOMPLETE",
                "useful_information": "",
                "missing_information": "The capital city of Mexico"
            }),
        );
        results.insert(
            StageId::SimilarityRetrieve,
            json!(["sim passage 1", "shared passage"]),
        );
        results.insert(StageId::KeywordExtract, json!(["capital", "Mexico"]));
        results.insert(
            StageId::KeywordRetrieve,
            json!(["shared passage", "kw passage 1"]),
        );
        results.insert(StageId::Rerank, json!(["shared passage"]));
        results.insert(StageId::Generate, json!("Mexico City"));
        results.insert(StageId::Evaluate, json!({"faithfulness": 0.92}));
        Self {
            results,
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_result(mut self, stage: StageId, value: Value) -> Self {
        self.results.insert(stage, value);
        self
    }

    fn failing(self, stage: StageId, times: u32) -> Self {
        self.failures.lock().unwrap().insert(stage, times);
        self
    }

    fn invoked_stages(&self) -> Vec<StageId> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(stage, _)| *stage)
            .collect()
    }

    fn request_for(&self, stage: StageId) -> Value {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, body)| body.clone())
            .unwrap_or_else(|| panic!("stage {} was never invoked", stage))
    }
}

#[async_trait]
impl StageInvoker for ScriptedWorker {
    async fn invoke(&self, stage: StageId, request: &StageRequest) -> Result<Value> {
        self.requests
            .lock()
            .unwrap()
            .push((stage, serde_json::to_value(request)?));

        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&stage) {
            if *left > 0 {
                *left -= 1;
                return Err(PipelineError::stage(stage, "connection refused"));
            }
        }

        self.results
            .get(&stage)
            .cloned()
            .ok_or_else(|| PipelineError::stage(stage, "no scripted result"))
    }
}

fn config(expert: bool, similarity: bool, keyword: bool, ragas: bool) -> RunConfig {
    RunConfig {
        use_expert: expert,
        use_similarity: similarity,
        use_keyword: keyword,
        use_rerank: RunConfig::derive_rerank(similarity, keyword, false),
        use_ragas: ragas,
        llm_model: "gemma2:9b".to_string(),
        embed_model: "imac/zpoint_large_embedding_zh".to_string(),
        document_types: "squad".to_string(),
        user_question: "What is the capital of Mexico?".to_string(),
    }
}

async fn run_pipeline(
    config: RunConfig,
    worker: Arc<ScriptedWorker>,
) -> (Run, RunReport) {
    let executor = TopologyExecutor::new(config.clone(), worker)
        .unwrap()
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
        });
    let run = Run::new_queued(config.user_question);
    executor.execute(run).await.unwrap()
}

#[tokio::test]
async fn test_full_dual_retrieval_with_rerank() {
    let worker = Arc::new(ScriptedWorker::new());
    let (run, report) = run_pipeline(config(true, true, true, false), worker.clone()).await;

    assert!(matches!(run.state, RunState::Completed { .. }));
    assert_eq!(report.answer.as_deref(), Some("Mexico City"));
    assert!(report.skipped.is_empty());

    // Worker calls in topological order; local stages never hit the worker.
    assert_eq!(
        worker.invoked_stages(),
        vec![
            StageId::ExpertRetrieve,
            StageId::ExpertValidate,
            StageId::SimilarityRetrieve,
            StageId::KeywordExtract,
            StageId::KeywordRetrieve,
            StageId::Rerank,
            StageId::Generate,
        ]
    );

    // Rerank received both result sets.
    let rerank = worker.request_for(StageId::Rerank);
    assert_eq!(rerank["topk"], 5);
    assert_eq!(rerank["similarity_results"][0], "sim passage 1");
    assert_eq!(rerank["keyword_results"][1], "kw passage 1");

    // Generation consumed the reranked passages.
    let generate = worker.request_for(StageId::Generate);
    assert_eq!(generate["types"], "rag");
    assert_eq!(generate["search_results_types"], "rerank");
    assert_eq!(generate["search_results"], json!(["shared passage"]));

    // Keyword retrieval carried the extracted keywords.
    let keyword = worker.request_for(StageId::KeywordRetrieve);
    assert_eq!(keyword["keyword_list"], json!(["capital", "Mexico"]));
}

#[tokio::test]
async fn test_expert_complete_short_circuits_retrieval() {
    let worker = Arc::new(ScriptedWorker::new().with_result(
        StageId::ExpertValidate,
        json!({
            "status": "COMPLETE",
            "useful_information": "The capital of Mexico is Mexico City.",
            "missing_information": ""
        }),
    ));
    let (run, report) = run_pipeline(config(true, true, true, true), worker.clone()).await;

    // Early termination is a completion, not a failure.
    match &run.state {
        RunState::Completed { skipped_stages, .. } => {
            assert_eq!(
                skipped_stages,
                &[
                    StageId::SimilarityRetrieve,
                    StageId::KeywordExtract,
                    StageId::KeywordRetrieve,
                    StageId::Rerank,
                    StageId::Evaluate,
                ]
            );
        }
        other => panic!("expected Completed, got {:?}", other),
    }

    assert_eq!(
        report.expert_answer.as_deref(),
        Some("The capital of Mexico is Mexico City.")
    );
    assert!(report.metrics.is_none());

    // Generation still ran, in general mode.
    let generate = worker.request_for(StageId::Generate);
    assert_eq!(generate["types"], "general");
    assert!(generate["search_results"].is_null());

    // No retrieval branch was invoked past the expert chain.
    assert_eq!(
        worker.invoked_stages(),
        vec![
            StageId::ExpertRetrieve,
            StageId::ExpertValidate,
            StageId::Generate,
        ]
    );
}

#[tokio::test]
async fn test_dual_retrieval_without_rerank_merges_contexts() {
    // Both branches enabled with rerank explicitly off: generation receives
    // the concatenated, deduplicated leaf outputs, similarity first.
    let mut config = config(false, true, true, false);
    config.use_rerank = false;

    let worker = Arc::new(ScriptedWorker::new());
    let (run, report) = run_pipeline(config, worker.clone()).await;

    assert!(matches!(run.state, RunState::Completed { .. }));
    assert_eq!(report.answer.as_deref(), Some("Mexico City"));
    assert!(!worker.invoked_stages().contains(&StageId::Rerank));

    let generate = worker.request_for(StageId::Generate);
    assert_eq!(generate["types"], "rag");
    assert_eq!(generate["search_results_types"], "merged");
    assert_eq!(
        generate["search_results"],
        json!(["sim passage 1", "shared passage", "kw passage 1"])
    );
}

#[tokio::test]
async fn test_evaluation_receives_result_sets_and_flags() {
    let worker = Arc::new(ScriptedWorker::new());
    let (run, report) = run_pipeline(config(false, true, true, true), worker.clone()).await;

    assert!(matches!(run.state, RunState::Completed { .. }));
    assert_eq!(report.metrics, Some(json!({"faithfulness": 0.92})));

    let ragas = worker.request_for(StageId::Evaluate);
    assert_eq!(ragas["llm_answer"], "Mexico City");
    assert_eq!(ragas["use_similarity"], true);
    assert_eq!(ragas["use_keyword"], true);
    assert_eq!(ragas["use_rerank"], true);
    assert_eq!(ragas["rerank_results"], json!(["shared passage"]));
    assert_eq!(
        ragas["similarity_results"],
        json!(["sim passage 1", "shared passage"])
    );
}

#[tokio::test]
async fn test_incomplete_validation_runs_only_enabled_branch() {
    // Expert chain with similarity only: INCOMPLETE selects similarity and
    // the keyword chain never exists in the topology.
    let worker = Arc::new(ScriptedWorker::new());
    let (run, _report) = run_pipeline(config(true, true, false, false), worker.clone()).await;

    assert!(matches!(run.state, RunState::Completed { .. }));
    assert_eq!(
        worker.invoked_stages(),
        vec![
            StageId::ExpertRetrieve,
            StageId::ExpertValidate,
            StageId::SimilarityRetrieve,
            StageId::Generate,
        ]
    );

    let generate = worker.request_for(StageId::Generate);
    assert_eq!(generate["search_results_types"], "similarity_retrieval");
}

#[tokio::test]
async fn test_transient_failures_retried_until_success() {
    let worker = Arc::new(ScriptedWorker::new().failing(StageId::SimilarityRetrieve, 2));
    let (run, report) = run_pipeline(config(false, true, false, false), worker.clone()).await;

    assert!(matches!(run.state, RunState::Completed { .. }));
    assert_eq!(report.answer.as_deref(), Some("Mexico City"));

    // Two failed attempts plus the successful third.
    let similarity_calls = worker
        .invoked_stages()
        .iter()
        .filter(|s| **s == StageId::SimilarityRetrieve)
        .count();
    assert_eq!(similarity_calls, 3);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_run_with_stage_id() {
    let worker = Arc::new(ScriptedWorker::new().failing(StageId::SimilarityRetrieve, 10));
    let (run, report) = run_pipeline(config(false, true, false, false), worker.clone()).await;

    match &run.state {
        RunState::Failed {
            failed_stage,
            error,
            ..
        } => {
            assert_eq!(*failed_stage, StageId::SimilarityRetrieve);
            assert!(error.contains("connection refused"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    assert!(report.answer.is_none());
    assert!(!worker.invoked_stages().contains(&StageId::Generate));
}

#[tokio::test]
async fn test_unknown_validation_status_is_fatal() {
    let worker = Arc::new(
        ScriptedWorker::new().with_result(StageId::ExpertValidate, json!({"status": "PARTIAL"})),
    );
    let (run, _report) = run_pipeline(config(true, true, true, false), worker.clone()).await;

    match &run.state {
        RunState::Failed {
            failed_stage,
            error,
            ..
        } => {
            assert_eq!(*failed_stage, StageId::ExpertBranch);
            assert!(error.contains("PARTIAL"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    // The fatal branch error was not retried against the worker.
    let validate_calls = worker
        .invoked_stages()
        .iter()
        .filter(|s| **s == StageId::ExpertValidate)
        .count();
    assert_eq!(validate_calls, 1);
}
