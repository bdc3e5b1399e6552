use crate::admission::AdmissionController;
use crate::branch::{evaluate_branch, BranchDecision};
use crate::client::StageInvoker;
use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use crate::request::{LlmRequest, RagasRequest, RerankRequest, RetrieveRequest, StageRequest};
use crate::run::{RetryPolicy, Run, RunStateMachine};
use crate::store::ResultStore;
use crate::topology::{build_topology, StageGraph, StageId};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

const EXPERT_TOPK: usize = 5;
const RETRIEVAL_TOPK: usize = 10;
const RERANK_TOPK: usize = 5;
const GENERATION_TEMPERATURE: f64 = 0.0;
const GENERATION_KEEP_ALIVE: &str = "0s";
const GENERATION_NUM_CTX: u32 = 8192;

/// Merged-leaves source marker sent to the generation worker when both
/// retrieval branches feed it without a rerank stage in between.
const MERGED_SOURCE: &str = "merged";

/// Final report for one run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub answer: Option<String>,
    /// Expert answer, present when the expert branch short-circuited.
    pub expert_answer: Option<String>,
    pub executed: Vec<StageId>,
    pub skipped: Vec<StageId>,
    /// Metric map produced by the evaluation stage, when it ran.
    pub metrics: Option<Value>,
    pub duration_ms: u64,
}

/// Mutable per-run walk state.
struct WalkState {
    current_stage: StageId,
    skipped: HashSet<StageId>,
    executed: Vec<StageId>,
    /// Set when the expert branch declared the question answered: the
    /// generation stage then runs in general mode.
    general_override: bool,
    expert_answer: Option<String>,
}

/// Walks the stage graph for one run: invokes each node through the stage
/// client, applies the expert-branch decision, and writes results to the
/// result store. Execution within a run is strictly sequential.
pub struct TopologyExecutor<I: StageInvoker> {
    config: RunConfig,
    graph: StageGraph,
    invoker: Arc<I>,
    retry: RetryPolicy,
    admission: AdmissionController,
}

impl<I: StageInvoker> TopologyExecutor<I> {
    pub fn new(config: RunConfig, invoker: Arc<I>) -> Result<Self> {
        let graph = build_topology(&config)?;
        Ok(Self {
            config,
            graph,
            invoker,
            retry: RetryPolicy::default(),
            admission: AdmissionController::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_admission(mut self, admission: AdmissionController) -> Self {
        self.admission = admission;
        self
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Execute a run (main entry point).
    ///
    /// A failed run is returned as `Ok((failed_run, partial_report))`: the
    /// failure is recorded on the run state, with the failing stage id and
    /// underlying cause.
    pub async fn execute(&self, run: Run) -> Result<(Run, RunReport)> {
        let _run_permit = self.admission.admit_run().await;
        let start = Instant::now();
        let run_id = run.id;

        info!("Starting run {} for question: {}", run_id, run.user_question);
        info!("Execution plan:\n{}", self.graph.execution_plan());

        let mut sm = RunStateMachine::with_retry_policy(run, self.retry);
        sm.start(StageId::GenerateQuery)?;

        let store = ResultStore::new(run_id);
        let mut walk = WalkState {
            current_stage: StageId::GenerateQuery,
            skipped: HashSet::new(),
            executed: Vec::new(),
            general_override: false,
            expert_answer: None,
        };

        let outcome = self.run_stages(&store, &mut walk, &mut sm).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let skipped: Vec<StageId> = self
            .graph
            .execution_order()
            .iter()
            .copied()
            .filter(|id| walk.skipped.contains(id))
            .collect();

        match outcome {
            Ok(()) => {
                let answer = store
                    .get(StageId::Generate)
                    .map(|value| value_to_text(&value))
                    .unwrap_or_default();
                let metrics = store.get(StageId::Evaluate);

                info!(
                    "Run {} completed in {}ms ({} stages executed, {} skipped)",
                    run_id,
                    duration_ms,
                    walk.executed.len(),
                    skipped.len()
                );

                sm.complete(answer.clone(), skipped.clone())?;
                let report = RunReport {
                    answer: Some(answer),
                    expert_answer: walk.expert_answer,
                    executed: walk.executed,
                    skipped,
                    metrics,
                    duration_ms,
                };
                Ok((sm.into_run(), report))
            }
            Err(e) => {
                let failed_stage = match &e {
                    PipelineError::StageExecution { stage, .. } => *stage,
                    _ => walk.current_stage,
                };
                error!("Run {} failed at stage {}: {}", run_id, failed_stage, e);

                sm.fail(e.to_string(), failed_stage, 0)?;
                let report = RunReport {
                    answer: None,
                    expert_answer: walk.expert_answer,
                    executed: walk.executed,
                    skipped,
                    metrics: None,
                    duration_ms,
                };
                Ok((sm.into_run(), report))
            }
        }
    }

    async fn run_stages(
        &self,
        store: &ResultStore,
        walk: &mut WalkState,
        sm: &mut RunStateMachine,
    ) -> Result<()> {
        for &stage in self.graph.execution_order() {
            if walk.skipped.contains(&stage) {
                info!("Stage {} skipped", stage);
                continue;
            }

            walk.current_stage = stage;
            sm.update_stage(stage)?;
            info!("Executing stage: {} ({})", stage.name(), stage);

            match stage {
                StageId::GenerateQuery => {
                    store.insert(stage, Value::String(self.config.user_question.clone()))?;
                }
                StageId::ExpertBranch => {
                    let validation = store.require(StageId::ExpertValidate)?;
                    self.apply_branch_decision(evaluate_branch(&validation, &self.config)?, walk);
                }
                _ => {
                    let request = self.build_request(stage, store, walk)?;
                    let result = self.invoke_with_retry(stage, &request).await?;
                    store.insert(stage, result)?;
                }
            }

            walk.executed.push(stage);
        }
        Ok(())
    }

    fn apply_branch_decision(&self, decision: BranchDecision, walk: &mut WalkState) {
        match decision {
            BranchDecision::Complete { expert_answer } => {
                let mut downstream = self.graph.downstream_of(StageId::ExpertBranch);
                downstream.remove(&StageId::Generate);
                info!(
                    "Expert branch complete: skipping {} downstream stages",
                    downstream.len()
                );
                walk.skipped.extend(downstream);
                walk.general_override = true;
                walk.expert_answer = Some(expert_answer);
            }
            BranchDecision::Continue { selected } => {
                // Retrieval roots present in the graph but not selected are
                // skipped along with their chains.
                if self.graph.contains(StageId::SimilarityRetrieve)
                    && !selected.contains(&StageId::SimilarityRetrieve)
                {
                    walk.skipped.insert(StageId::SimilarityRetrieve);
                }
                if self.graph.contains(StageId::KeywordExtract)
                    && !selected.contains(&StageId::KeywordExtract)
                {
                    walk.skipped.insert(StageId::KeywordExtract);
                    walk.skipped.insert(StageId::KeywordRetrieve);
                }
            }
        }
    }

    /// Call a worker with bounded retry and fixed backoff. Only transient
    /// failures are retried; everything else propagates immediately.
    async fn invoke_with_retry(&self, stage: StageId, request: &StageRequest) -> Result<Value> {
        let mut attempt = 1u32;
        loop {
            let result = {
                let _call_permit = self.admission.admit_stage_call().await;
                self.invoker.invoke(stage, request).await
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        "Stage {} attempt {}/{} failed: {}; retrying in {:?}",
                        stage, attempt, self.retry.max_attempts, e, self.retry.backoff
                    );
                    tokio::time::sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_request(
        &self,
        stage: StageId,
        store: &ResultStore,
        walk: &WalkState,
    ) -> Result<StageRequest> {
        let user_question = text_result(store, StageId::GenerateQuery)?;

        let request = match stage {
            StageId::ExpertRetrieve => StageRequest::Retrieve(RetrieveRequest {
                types: "expert".to_string(),
                document_types: self.config.document_types.clone(),
                topk: EXPERT_TOPK,
                embed_model: self.config.embed_model.clone(),
                user_question,
                keyword_list: vec![],
            }),
            StageId::SimilarityRetrieve => StageRequest::Retrieve(RetrieveRequest {
                types: "similarity".to_string(),
                document_types: self.config.document_types.clone(),
                topk: RETRIEVAL_TOPK,
                embed_model: self.config.embed_model.clone(),
                user_question,
                keyword_list: vec![],
            }),
            StageId::KeywordRetrieve => StageRequest::Retrieve(RetrieveRequest {
                types: "keyword".to_string(),
                document_types: self.config.document_types.clone(),
                topk: RETRIEVAL_TOPK,
                embed_model: self.config.embed_model.clone(),
                user_question,
                keyword_list: list_result(store, StageId::KeywordExtract)?,
            }),
            StageId::KeywordExtract => StageRequest::Llm(LlmRequest {
                user_question,
                types: "keyword".to_string(),
                model: self.config.llm_model.clone(),
                temperature: GENERATION_TEMPERATURE,
                keep_alive: GENERATION_KEEP_ALIVE.to_string(),
                num_ctx: GENERATION_NUM_CTX,
                search_results_types: None,
                search_results: None,
            }),
            StageId::ExpertValidate => StageRequest::Llm(LlmRequest {
                user_question,
                types: "validation".to_string(),
                model: self.config.llm_model.clone(),
                temperature: GENERATION_TEMPERATURE,
                keep_alive: GENERATION_KEEP_ALIVE.to_string(),
                num_ctx: GENERATION_NUM_CTX,
                search_results_types: Some(StageId::ExpertRetrieve.to_string()),
                search_results: Some(list_result(store, StageId::ExpertRetrieve)?),
            }),
            StageId::Generate => {
                let general = walk.general_override || self.graph.general_mode();
                if general {
                    StageRequest::Llm(LlmRequest {
                        user_question,
                        types: "general".to_string(),
                        model: self.config.llm_model.clone(),
                        temperature: GENERATION_TEMPERATURE,
                        keep_alive: GENERATION_KEEP_ALIVE.to_string(),
                        num_ctx: GENERATION_NUM_CTX,
                        search_results_types: None,
                        search_results: None,
                    })
                } else {
                    let (source, passages) = self.generation_context(store)?;
                    StageRequest::Llm(LlmRequest {
                        user_question,
                        types: "rag".to_string(),
                        model: self.config.llm_model.clone(),
                        temperature: GENERATION_TEMPERATURE,
                        keep_alive: GENERATION_KEEP_ALIVE.to_string(),
                        num_ctx: GENERATION_NUM_CTX,
                        search_results_types: Some(source),
                        search_results: Some(passages),
                    })
                }
            }
            StageId::Rerank => StageRequest::Rerank(RerankRequest {
                topk: RERANK_TOPK,
                user_question,
                similarity_results: optional_list(store, StageId::SimilarityRetrieve)?
                    .unwrap_or_default(),
                keyword_results: optional_list(store, StageId::KeywordRetrieve)?
                    .unwrap_or_default(),
            }),
            StageId::Evaluate => StageRequest::Ragas(RagasRequest {
                user_question,
                llm_answer: text_result(store, StageId::Generate)?,
                similarity_results: if self.config.use_similarity {
                    optional_list(store, StageId::SimilarityRetrieve)?
                } else {
                    None
                },
                keyword_results: if self.config.use_keyword {
                    optional_list(store, StageId::KeywordRetrieve)?
                } else {
                    None
                },
                rerank_results: if self.config.use_rerank {
                    optional_list(store, StageId::Rerank)?
                } else {
                    None
                },
                use_similarity: self.config.use_similarity,
                use_keyword: self.config.use_keyword,
                use_rerank: self.config.use_rerank,
            }),
            StageId::GenerateQuery | StageId::ExpertBranch => {
                return Err(PipelineError::TopologyBuild(format!(
                    "stage {} is executed locally, not through a worker",
                    stage
                )))
            }
        };
        Ok(request)
    }

    /// Resolve the retrieved context feeding generation: the rerank output
    /// when present, a single leaf's output directly, or the merged output
    /// of several leaves (concatenate-deduplicate, similarity first).
    fn generation_context(&self, store: &ResultStore) -> Result<(String, Vec<String>)> {
        let inputs = &self
            .graph
            .get(StageId::Generate)
            .ok_or_else(|| PipelineError::TopologyBuild("generate node absent".to_string()))?
            .depends_on;

        if inputs == &[StageId::Rerank] {
            return Ok((
                StageId::Rerank.to_string(),
                list_result(store, StageId::Rerank)?,
            ));
        }
        if let [leaf] = inputs[..] {
            return Ok((leaf.to_string(), list_result(store, leaf)?));
        }

        let mut merged = Vec::new();
        let mut seen = HashSet::new();
        for &leaf in inputs {
            for passage in list_result(store, leaf)? {
                if seen.insert(passage.clone()) {
                    merged.push(passage);
                }
            }
        }
        Ok((MERGED_SOURCE.to_string(), merged))
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn text_result(store: &ResultStore, stage: StageId) -> Result<String> {
    let value = store.require(stage)?;
    match value {
        Value::String(s) => Ok(s),
        other => Err(PipelineError::parse(format!(
            "stage {} produced a non-text result: {}",
            stage, other
        ))),
    }
}

fn list_result(store: &ResultStore, stage: StageId) -> Result<Vec<String>> {
    let value = store.require(stage)?;
    serde_json::from_value(value).map_err(|e| {
        PipelineError::parse(format!("stage {} produced a non-list result: {}", stage, e))
    })
}

fn optional_list(store: &ResultStore, stage: StageId) -> Result<Option<Vec<String>>> {
    match store.get(stage) {
        Some(value) => {
            let list = serde_json::from_value(value).map_err(|e| {
                PipelineError::parse(format!("stage {} produced a non-list result: {}", stage, e))
            })?;
            Ok(Some(list))
        }
        None => Ok(None),
    }
}
