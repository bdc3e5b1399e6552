use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use tokio::sync::OnceCell;

/// One stage worker's task logic, mounted by the harness behind a uniform
/// HTTP surface. Implementations decode their own request shape from the
/// JSON body and return the bare result value; the harness adds the
/// `{"status", "result"}` envelope.
#[async_trait]
pub trait StageService: Send + Sync + 'static {
    /// Service name reported by the health endpoint.
    fn service_name(&self) -> &'static str;

    /// Path segment of the task endpoint (`POST /{task_route}`).
    fn task_route(&self) -> &'static str;

    async fn handle(&self, request: Value) -> Result<Value>;
}

/// Lazily initialized model handle, shared across requests.
///
/// Model loading is expensive, so it happens on first use rather than at
/// process start, and exactly once even under concurrent first requests.
/// A failed initialization is not cached: the next request retries.
pub struct LazyModel<T> {
    cell: OnceCell<T>,
}

impl<T> LazyModel<T> {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<&T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.cell.get_or_try_init(init).await
    }

    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }

    pub fn initialized(&self) -> bool {
        self.cell.initialized()
    }
}

impl<T> Default for LazyModel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_initializes_once() {
        let model: LazyModel<String> = LazyModel::new();
        let init_count = AtomicU32::new(0);

        for _ in 0..3 {
            let value = model
                .get_or_try_init(|| async {
                    init_count.fetch_add(1, Ordering::SeqCst);
                    Ok("weights".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "weights");
        }

        assert_eq!(init_count.load(Ordering::SeqCst), 1);
        assert!(model.initialized());
    }

    #[tokio::test]
    async fn test_failed_init_is_retried() {
        let model: LazyModel<String> = LazyModel::new();

        let err = model
            .get_or_try_init(|| async {
                Err(WorkerError::ModelInit("weights not found".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ModelInit(_)));
        assert!(!model.initialized());

        let value = model
            .get_or_try_init(|| async { Ok("weights".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "weights");
    }
}
