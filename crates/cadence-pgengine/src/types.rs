use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadence_core::{RunState, TaskKind};

/// A live chain execution config that is due for this client.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChainConfig {
    #[sqlx(rename = "chain_execution_config")]
    pub config_id: i64,
    /// Head element of the chain.
    pub chain_id: i64,
    pub chain_name: String,
    /// Clear `live` after the first successful run.
    pub self_destruct: bool,
    /// At most one run of this config at a time.
    pub exclusive_execution: bool,
    /// NULL in the store is read as the default of 16.
    pub max_instances: i32,
}

/// One step of a chain, joined with its base task.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChainElement {
    pub chain_id: i64,
    pub task_id: i64,
    pub task_name: String,
    /// SQL text, executable path, or unused for built-ins.
    pub script: String,
    #[sqlx(try_from = "String")]
    pub kind: TaskKind,
    /// Role to impersonate while the step runs.
    pub run_uid: Option<String>,
    pub ignore_error: bool,
    /// `timetable.database_connection` id of a remote target.
    pub database_connection: Option<i64>,
    /// Depth in the chain, head = 0.
    pub step_order: i32,
}

/// A `timetable.run_status` row as seen by crash recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunStatusRow {
    #[sqlx(rename = "run_status")]
    pub run_id: i64,
    #[sqlx(rename = "chain_execution_config")]
    pub config_id: i64,
    pub chain_id: i64,
    #[sqlx(rename = "execution_status", try_from = "String")]
    pub state: RunState,
}

/// What gets appended to `timetable.execution_log` for one executed step.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub config_id: i64,
    pub chain_id: i64,
    pub task_id: i64,
    pub name: String,
    pub script: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 0 on success, the exit code of a failed program, -1 otherwise.
    pub return_code: i32,
}
