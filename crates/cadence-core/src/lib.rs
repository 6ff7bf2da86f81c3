//! `cadence-core` — configuration, shared domain types and the error type
//! used by every other cadence crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CadenceConfig, DatabaseConfig, DispatchMode, SchedulerConfig};
pub use error::{CadenceError, Result};
pub use types::{LogLevel, LogSink, RunState, TaskKind};
