#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker was terminated")]
    Terminated,

    #[error("Worker initialization failed: {0}")]
    Initialization(String),

    #[error("{message}")]
    Conversion {
        message: String,
        code: Option<String>,
        input_size: Option<usize>,
        output_size: Option<usize>,
    },

    #[error("Worker state error: {0}")]
    StateError(String),

    #[error("Worker channel closed: {0}")]
    Channel(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl WorkerError {
    /// Machine-readable code, when the worker reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            WorkerError::Terminated => Some("terminated"),
            WorkerError::Conversion { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for WorkerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        WorkerError::Terminated
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for WorkerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        WorkerError::Channel("orchestrator is no longer receiving requests".to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for WorkerError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        WorkerError::StateError("Pending request table is corrupted".to_string())
    }
}
