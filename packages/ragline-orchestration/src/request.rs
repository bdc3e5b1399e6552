use crate::config::WorkerService;
use serde::{Deserialize, Serialize};

/// Retrieval worker request (`POST /retrieve`).
///
/// `types` selects the retrieval mode on the worker side: `expert`,
/// `similarity`, or `keyword`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub types: String,
    pub document_types: String,
    pub topk: usize,
    pub embed_model: String,
    pub user_question: String,
    #[serde(default)]
    pub keyword_list: Vec<String>,
}

/// Rerank worker request (`POST /rerank`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankRequest {
    pub topk: usize,
    pub user_question: String,
    #[serde(default)]
    pub similarity_results: Vec<String>,
    #[serde(default)]
    pub keyword_results: Vec<String>,
}

/// LLM worker request (`POST /llm`). Serves generation (`rag`/`general`),
/// keyword extraction, and expert validation depending on `types`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub user_question: String,
    pub types: String,
    pub model: String,
    pub temperature: f64,
    pub keep_alive: String,
    pub num_ctx: u32,
    pub search_results_types: Option<String>,
    pub search_results: Option<Vec<String>>,
}

/// Evaluation worker request (`POST /ragas`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagasRequest {
    pub user_question: String,
    pub llm_answer: String,
    pub similarity_results: Option<Vec<String>>,
    pub keyword_results: Option<Vec<String>>,
    pub rerank_results: Option<Vec<String>>,
    pub use_similarity: bool,
    pub use_keyword: bool,
    pub use_rerank: bool,
}

/// Uniform request value covering every stage kind, so the client invokes
/// each worker identically.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageRequest {
    Retrieve(RetrieveRequest),
    Rerank(RerankRequest),
    Llm(LlmRequest),
    Ragas(RagasRequest),
}

impl StageRequest {
    pub fn service(&self) -> WorkerService {
        match self {
            StageRequest::Retrieve(_) => WorkerService::Retrieval,
            StageRequest::Rerank(_) => WorkerService::Rerank,
            StageRequest::Llm(_) => WorkerService::Llm,
            StageRequest::Ragas(_) => WorkerService::Ragas,
        }
    }

    /// Task endpoint verb on the worker.
    pub fn verb(&self) -> &'static str {
        match self {
            StageRequest::Retrieve(_) => "retrieve",
            StageRequest::Rerank(_) => "rerank",
            StageRequest::Llm(_) => "llm",
            StageRequest::Ragas(_) => "ragas",
        }
    }
}
