use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Model initialization failed: {0}")]
    ModelInit(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn bad_request<E: std::fmt::Display>(e: E) -> Self {
        Self::BadRequest(e.to_string())
    }

    pub fn task<E: std::fmt::Display>(e: E) -> Self {
        Self::Task(e.to_string())
    }

    /// HTTP status code surfaced for this error on the task endpoint.
    pub fn status_code(&self) -> u16 {
        match self {
            WorkerError::BadRequest(_) => 422,
            _ => 500,
        }
    }
}
