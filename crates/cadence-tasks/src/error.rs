use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    /// No built-in task is registered under the name.
    #[error("No built-in task found: {name}")]
    NotFound { name: String },

    /// The parameter value could not be interpreted by the task.
    #[error("Invalid parameter for {task}: {reason}")]
    InvalidParameter { task: &'static str, reason: String },

    /// The task ran and reported a failure.
    #[error("{task} failed: {reason}")]
    Failed { task: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
