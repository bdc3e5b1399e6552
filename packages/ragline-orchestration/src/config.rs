use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Feature flags section of the persisted run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineFlags {
    #[serde(default)]
    pub use_expert_retrieval: bool,
    #[serde(default)]
    pub use_similarity_retrieval: bool,
    #[serde(default)]
    pub use_keyword_retrieval: bool,
    #[serde(default)]
    pub use_rerank: bool,
    #[serde(default)]
    pub use_ragas: bool,
}

fn default_llm_model() -> String {
    "gemma2:9b".to_string()
}

fn default_embed_model() -> String {
    "imac/zpoint_large_embedding_zh".to_string()
}

fn default_document_types() -> String {
    "squad".to_string()
}

/// Persisted run configuration document (config.json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfigDocument {
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    #[serde(default)]
    pub file_list: Vec<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_document_types")]
    pub document_types: String,
    pub user_question: Option<String>,
    #[serde(default)]
    pub rag_pipeline_config: PipelineFlags,
}

impl RunConfigDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(PipelineError::config)
    }
}

/// Immutable per-run configuration, built once at run start.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub use_expert: bool,
    pub use_similarity: bool,
    pub use_keyword: bool,
    pub use_rerank: bool,
    pub use_ragas: bool,

    pub llm_model: String,
    pub embed_model: String,
    pub document_types: String,
    pub user_question: String,
}

impl RunConfig {
    /// Resolve a config document into the immutable run configuration.
    ///
    /// Rerank enablement is derived: forced on when both retrieval branches
    /// are enabled, taken from the configured flag when exactly one is, and
    /// forced off when neither is.
    pub fn resolve(doc: RunConfigDocument) -> Result<Self> {
        let user_question = doc
            .user_question
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("missing user_question".to_string()))?;

        let flags = &doc.rag_pipeline_config;
        let use_rerank = Self::derive_rerank(
            flags.use_similarity_retrieval,
            flags.use_keyword_retrieval,
            flags.use_rerank,
        );

        let config = Self {
            use_expert: flags.use_expert_retrieval,
            use_similarity: flags.use_similarity_retrieval,
            use_keyword: flags.use_keyword_retrieval,
            use_rerank,
            use_ragas: flags.use_ragas,
            llm_model: doc.llm_model,
            embed_model: doc.embed_model,
            document_types: doc.document_types,
            user_question,
        };

        info!(
            "Resolved pipeline config: expert={}, similarity={}, keyword={}, rerank={}, ragas={}",
            config.use_expert,
            config.use_similarity,
            config.use_keyword,
            config.use_rerank,
            config.use_ragas
        );

        Ok(config)
    }

    pub fn derive_rerank(use_similarity: bool, use_keyword: bool, configured: bool) -> bool {
        if use_similarity && use_keyword {
            true
        } else if use_similarity || use_keyword {
            configured
        } else {
            false
        }
    }
}

/// One stage-worker service reachable over HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerService {
    Retrieval,
    Rerank,
    Llm,
    Ragas,
}

impl WorkerService {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerService::Retrieval => "retrieval",
            WorkerService::Rerank => "rerank",
            WorkerService::Llm => "llm",
            WorkerService::Ragas => "ragas",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            WorkerService::Retrieval => "RETRIEVAL_API",
            WorkerService::Rerank => "RERANK_API",
            WorkerService::Llm => "LLM_API",
            WorkerService::Ragas => "RAGAS_API",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            WorkerService::Retrieval => 8000,
            WorkerService::Rerank => 8001,
            WorkerService::Llm => 8002,
            WorkerService::Ragas => 8003,
        }
    }
}

/// Network target for one worker service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTarget {
    pub host: String,
    pub port: u16,
}

/// Resolved network configuration for all stage workers plus the external
/// backends the workers themselves talk to.
#[derive(Debug, Clone)]
pub struct StageEndpoints {
    pub retrieval: ServiceTarget,
    pub rerank: ServiceTarget,
    pub llm: ServiceTarget,
    pub ragas: ServiceTarget,

    pub ollama_url: Option<String>,
    pub qdrant_url: Option<String>,
    pub openai_api_key: Option<String>,
}

impl StageEndpoints {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve endpoints through an injectable lookup, so tests never touch
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let target = |service: WorkerService| -> Result<ServiceTarget> {
            let host = lookup(&format!("{}_HOST", service.env_prefix()))
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let port = match lookup(&format!("{}_PORT", service.env_prefix())) {
                Some(raw) => raw.parse::<u16>().map_err(|e| {
                    PipelineError::Config(format!(
                        "invalid {}_PORT '{}': {}",
                        service.env_prefix(),
                        raw,
                        e
                    ))
                })?,
                None => service.default_port(),
            };
            Ok(ServiceTarget { host, port })
        };

        Ok(Self {
            retrieval: target(WorkerService::Retrieval)?,
            rerank: target(WorkerService::Rerank)?,
            llm: target(WorkerService::Llm)?,
            ragas: target(WorkerService::Ragas)?,
            ollama_url: lookup("OLLAMA_HOST"),
            qdrant_url: lookup("QDRANT_URL"),
            openai_api_key: lookup("OPENAI_API_KEY"),
        })
    }

    pub fn target(&self, service: WorkerService) -> &ServiceTarget {
        match service {
            WorkerService::Retrieval => &self.retrieval,
            WorkerService::Rerank => &self.rerank,
            WorkerService::Llm => &self.llm,
            WorkerService::Ragas => &self.ragas,
        }
    }
}
