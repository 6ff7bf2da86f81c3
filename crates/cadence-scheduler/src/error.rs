use thiserror::Error;

use cadence_pgengine::PgEngineError;
use cadence_tasks::TaskError;

/// Errors that can occur while discovering, claiming or running chains.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store access or SQL step failure.
    #[error(transparent)]
    PgEngine(#[from] PgEngineError),

    /// A built-in task failed or does not exist.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// A remote target could not be reached or rejected the step.
    ///
    /// Kept apart from [`SchedulerError::PgEngine`] so a dead remote is never
    /// mistaken for a lost store connection.
    #[error("Remote connection {connection_id}: {reason}")]
    Remote { connection_id: i64, reason: String },

    /// A program step's command line is unusable.
    #[error("Invalid program step: {0}")]
    InvalidProgram(String),

    /// A program step exited unsuccessfully.
    #[error("{command} exited with code {exit_code}: {output}")]
    Program {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process took over this scheduler's identity.
    #[error("Identity lock for '{client_name}' is held by another process")]
    LockLost { client_name: String },
}

impl SchedulerError {
    /// True when the store connection is gone and the engine must reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SchedulerError::PgEngine(e) if e.is_connection_lost())
    }

    /// No pooled store connection became free in time.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, SchedulerError::PgEngine(e) if e.is_pool_exhausted())
    }

    /// Value recorded in `execution_log.returncode` for a failed step.
    pub fn return_code(&self) -> i32 {
        match self {
            SchedulerError::Program { exit_code, .. } => *exit_code,
            _ => -1,
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::PgEngine(e.into())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
