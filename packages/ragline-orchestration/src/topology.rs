use crate::config::RunConfig;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Stage identifier. Each stage kind occurs at most once per run, so the
/// kind doubles as the node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageId {
    GenerateQuery,
    ExpertRetrieve,
    ExpertValidate,
    ExpertBranch,
    SimilarityRetrieve,
    KeywordExtract,
    KeywordRetrieve,
    Rerank,
    Generate,
    Evaluate,
}

impl StageId {
    pub const ALL: [StageId; 10] = [
        StageId::GenerateQuery,
        StageId::ExpertRetrieve,
        StageId::ExpertValidate,
        StageId::ExpertBranch,
        StageId::SimilarityRetrieve,
        StageId::KeywordExtract,
        StageId::KeywordRetrieve,
        StageId::Rerank,
        StageId::Generate,
        StageId::Evaluate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::GenerateQuery => "generate_query",
            StageId::ExpertRetrieve => "expert_retrieval",
            StageId::ExpertValidate => "expert_validation",
            StageId::ExpertBranch => "expert_branch",
            StageId::SimilarityRetrieve => "similarity_retrieval",
            StageId::KeywordExtract => "keyword_extraction",
            StageId::KeywordRetrieve => "keyword_retrieval",
            StageId::Rerank => "rerank",
            StageId::Generate => "generate",
            StageId::Evaluate => "evaluate",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "generate_query" => Ok(StageId::GenerateQuery),
            "expert_retrieval" => Ok(StageId::ExpertRetrieve),
            "expert_validation" => Ok(StageId::ExpertValidate),
            "expert_branch" => Ok(StageId::ExpertBranch),
            "similarity_retrieval" => Ok(StageId::SimilarityRetrieve),
            "keyword_extraction" => Ok(StageId::KeywordExtract),
            "keyword_retrieval" => Ok(StageId::KeywordRetrieve),
            "rerank" => Ok(StageId::Rerank),
            "generate" => Ok(StageId::Generate),
            "evaluate" => Ok(StageId::Evaluate),
            _ => Err(PipelineError::parse(format!("Invalid stage ID: {}", s))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageId::GenerateQuery => "Query Generation",
            StageId::ExpertRetrieve => "Expert Retrieval",
            StageId::ExpertValidate => "Expert Validation",
            StageId::ExpertBranch => "Expert Branching",
            StageId::SimilarityRetrieve => "Similarity Retrieval",
            StageId::KeywordExtract => "Keyword Extraction",
            StageId::KeywordRetrieve => "Keyword Retrieval",
            StageId::Rerank => "Reranking",
            StageId::Generate => "Answer Generation",
            StageId::Evaluate => "RAGAS Evaluation",
        }
    }

    /// Stages executed inside the orchestrator, without a worker call.
    pub fn is_local(&self) -> bool {
        matches!(self, StageId::GenerateQuery | StageId::ExpertBranch)
    }

    /// Per-stage call timeout. Rerank workers answer fast; everything else
    /// may block on model inference.
    pub fn timeout(&self) -> Duration {
        match self {
            StageId::Rerank => Duration::from_secs(30),
            _ => Duration::from_secs(300),
        }
    }

    fn order_index(&self) -> usize {
        Self::ALL.iter().position(|id| id == self).unwrap_or(usize::MAX)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stage node in the topology.
#[derive(Debug, Clone)]
pub struct StageNode {
    pub id: StageId,
    pub name: &'static str,
    pub depends_on: Vec<StageId>,
    pub timeout: Duration,
}

impl StageNode {
    pub fn new(id: StageId, depends_on: Vec<StageId>) -> Self {
        Self {
            id,
            name: id.name(),
            depends_on,
            timeout: id.timeout(),
        }
    }
}

/// The DAG of stages selected and connected for one run configuration.
#[derive(Debug, Clone)]
pub struct StageGraph {
    nodes: HashMap<StageId, StageNode>,
    execution_order: Vec<StageId>,
    retrieval_leaves: Vec<StageId>,
}

impl StageGraph {
    pub fn new(nodes: Vec<StageNode>, retrieval_leaves: Vec<StageId>) -> Result<Self> {
        let mut node_map = HashMap::new();
        for node in nodes {
            node_map.insert(node.id, node);
        }

        for node in node_map.values() {
            for dep in &node.depends_on {
                if !node_map.contains_key(dep) {
                    return Err(PipelineError::TopologyBuild(format!(
                        "stage {} depends on absent stage {}",
                        node.id, dep
                    )));
                }
            }
        }

        let execution_order = Self::topological_sort(&node_map)?;

        Ok(Self {
            nodes: node_map,
            execution_order,
            retrieval_leaves,
        })
    }

    /// Deterministic Kahn sort: among ready nodes, pipeline declaration
    /// order wins. The run executes stages strictly in this order.
    fn topological_sort(nodes: &HashMap<StageId, StageNode>) -> Result<Vec<StageId>> {
        let mut in_degree: HashMap<StageId, usize> = nodes
            .values()
            .map(|node| (node.id, node.depends_on.len()))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        let mut processed: HashSet<StageId> = HashSet::new();

        while processed.len() < nodes.len() {
            let mut ready: Vec<StageId> = in_degree
                .iter()
                .filter(|(id, &degree)| degree == 0 && !processed.contains(*id))
                .map(|(&id, _)| id)
                .collect();

            if ready.is_empty() {
                return Err(PipelineError::DagCycleDetected);
            }
            ready.sort_by_key(|id| id.order_index());

            for stage_id in ready {
                order.push(stage_id);
                processed.insert(stage_id);
                in_degree.remove(&stage_id);

                for dependent in nodes.values() {
                    if dependent.depends_on.contains(&stage_id) {
                        if let Some(degree) = in_degree.get_mut(&dependent.id) {
                            *degree -= 1;
                        }
                    }
                }
            }
        }

        Ok(order)
    }

    pub fn execution_order(&self) -> &[StageId] {
        &self.execution_order
    }

    pub fn get(&self, id: StageId) -> Option<&StageNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Retrieval leaves feeding the convergence point (rerank or generate),
    /// in similarity-first order.
    pub fn retrieval_leaves(&self) -> &[StageId] {
        &self.retrieval_leaves
    }

    /// No retrieval branch exists; generation runs over no external context.
    pub fn general_mode(&self) -> bool {
        self.retrieval_leaves.is_empty()
    }

    /// Transitive dependents of a stage.
    pub fn downstream_of(&self, id: StageId) -> HashSet<StageId> {
        let mut downstream = HashSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for node in self.nodes.values() {
                if node.depends_on.contains(&current) && downstream.insert(node.id) {
                    frontier.push(node.id);
                }
            }
        }
        downstream
    }

    /// Execution plan as string (for logging).
    pub fn execution_plan(&self) -> String {
        self.execution_order
            .iter()
            .enumerate()
            .map(|(i, id)| format!("Step {}: {}", i + 1, id.name()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Build the stage graph for a run configuration.
///
/// Pure and deterministic: the only runtime branch in the whole pipeline is
/// the expert-branch decision, which is evaluated during execution, not
/// here. "Not used" is the absence of a node.
pub fn build_topology(config: &RunConfig) -> Result<StageGraph> {
    let mut nodes = vec![StageNode::new(StageId::GenerateQuery, vec![])];
    let mut cursor = StageId::GenerateQuery;

    if config.use_expert {
        nodes.push(StageNode::new(StageId::ExpertRetrieve, vec![cursor]));
        nodes.push(StageNode::new(
            StageId::ExpertValidate,
            vec![StageId::ExpertRetrieve],
        ));
        nodes.push(StageNode::new(
            StageId::ExpertBranch,
            vec![StageId::ExpertValidate],
        ));
        cursor = StageId::ExpertBranch;
    }

    let mut retrieval_leaves = Vec::new();

    if config.use_similarity {
        nodes.push(StageNode::new(StageId::SimilarityRetrieve, vec![cursor]));
        retrieval_leaves.push(StageId::SimilarityRetrieve);
    }

    if config.use_keyword {
        nodes.push(StageNode::new(StageId::KeywordExtract, vec![cursor]));
        nodes.push(StageNode::new(
            StageId::KeywordRetrieve,
            vec![StageId::KeywordExtract],
        ));
        retrieval_leaves.push(StageId::KeywordRetrieve);
    }

    // Convergence into generation. With several leaves and rerank disabled,
    // generate depends on every leaf and the executor merges their passages
    // (concatenate-deduplicate, similarity first).
    let generate_inputs = if config.use_rerank && !retrieval_leaves.is_empty() {
        nodes.push(StageNode::new(StageId::Rerank, retrieval_leaves.clone()));
        vec![StageId::Rerank]
    } else if !retrieval_leaves.is_empty() {
        retrieval_leaves.clone()
    } else {
        vec![cursor]
    };
    nodes.push(StageNode::new(StageId::Generate, generate_inputs.clone()));

    if config.use_ragas && !retrieval_leaves.is_empty() {
        let mut evaluate_deps = vec![StageId::Generate];
        evaluate_deps.extend(generate_inputs);
        nodes.push(StageNode::new(StageId::Evaluate, evaluate_deps));
    }

    StageGraph::new(nodes, retrieval_leaves)
}
