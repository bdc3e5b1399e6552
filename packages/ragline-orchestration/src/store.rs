use crate::error::{PipelineError, Result};
use crate::topology::StageId;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

/// Per-run key/value exchange between stages, keyed by stage id.
///
/// The only channel through which a stage's output reaches later stages.
/// Entries are write-once: a second insert for the same stage is rejected,
/// so an at-most-once violation in the executor surfaces instead of being
/// silently masked. Reads of unwritten ids return `None`, never a default.
pub struct ResultStore {
    run_id: Uuid,
    entries: DashMap<StageId, Value>,
}

impl ResultStore {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            entries: DashMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn insert(&self, stage: StageId, value: Value) -> Result<()> {
        match self.entries.entry(stage) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(PipelineError::DuplicateResult(stage))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    pub fn get(&self, stage: StageId) -> Option<Value> {
        self.entries.get(&stage).map(|entry| entry.value().clone())
    }

    /// Read a dependency that must have been produced upstream.
    pub fn require(&self, stage: StageId) -> Result<Value> {
        self.get(stage)
            .ok_or_else(|| PipelineError::MissingDependency(stage.to_string()))
    }

    pub fn contains(&self, stage: StageId) -> bool {
        self.entries.contains_key(&stage)
    }

    pub fn completed(&self) -> HashSet<StageId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_and_get() {
        let store = ResultStore::new(Uuid::new_v4());
        store
            .insert(StageId::GenerateQuery, json!("Who proposed inertia?"))
            .unwrap();
        assert_eq!(
            store.get(StageId::GenerateQuery),
            Some(json!("Who proposed inertia?"))
        );
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let store = ResultStore::new(Uuid::new_v4());
        store.insert(StageId::Generate, json!("first")).unwrap();

        let err = store.insert(StageId::Generate, json!("second")).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DuplicateResult(StageId::Generate)
        ));
        // The original value stays in place.
        assert_eq!(store.get(StageId::Generate), Some(json!("first")));
    }

    #[test]
    fn test_absent_read_is_none_not_default() {
        let store = ResultStore::new(Uuid::new_v4());
        assert_eq!(store.get(StageId::Rerank), None);

        let err = store.require(StageId::Rerank).unwrap_err();
        assert!(matches!(err, PipelineError::MissingDependency(_)));
    }

    #[test]
    fn test_completed_stages() {
        let store = ResultStore::new(Uuid::new_v4());
        store.insert(StageId::GenerateQuery, json!("q")).unwrap();
        store
            .insert(StageId::SimilarityRetrieve, json!(["passage-1"]))
            .unwrap();

        let completed = store.completed();
        assert_eq!(completed.len(), 2);
        assert!(completed.contains(&StageId::GenerateQuery));
        assert!(completed.contains(&StageId::SimilarityRetrieve));
    }
}
