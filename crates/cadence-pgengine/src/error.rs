use thiserror::Error;

/// Errors raised while talking to the configuration store or a remote target.
#[derive(Debug, Error)]
pub enum PgEngineError {
    /// Underlying sqlx / PostgreSQL error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The SQL body of a task is empty or whitespace only.
    #[error("SQL script cannot be empty")]
    EmptyScript,

    /// A parameter value is not a JSON array of positional arguments.
    #[error("Invalid parameter value #{index}: {reason}")]
    InvalidParameter { index: usize, reason: String },

    /// A `database_connection` reference or its connect string is unusable.
    #[error("Malformed database connection: {0}")]
    MalformedConnection(String),

    /// A collaborator table of the timetable schema is not installed.
    #[error("Schema object missing: timetable.{0}")]
    SchemaMissing(String),

    /// The store stayed unreachable for every reconnect attempt.
    #[error("Store unreachable after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Core(#[from] cadence_core::CadenceError),
}

impl PgEngineError {
    /// Validation errors are raised before any store round trip.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PgEngineError::EmptyScript
                | PgEngineError::InvalidParameter { .. }
                | PgEngineError::MalformedConnection(_)
        )
    }

    /// True when the error means the store connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            PgEngineError::Database(e) => crate::store::is_connection_error(e),
            PgEngineError::ReconnectExhausted { .. } => true,
            _ => false,
        }
    }

    /// No pooled connection became free in time. The server may still be up.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, PgEngineError::Database(sqlx::Error::PoolTimedOut))
    }
}

pub type Result<T> = std::result::Result<T, PgEngineError>;
