//! `timetable.run_status` bookkeeping: one row per chain run, updated in place.

use sqlx::postgres::PgConnection;

use cadence_core::RunState;

use crate::error::Result;
use crate::types::RunStatusRow;

/// Serialize eligibility checks for one config across all schedulers until
/// the surrounding transaction ends.
pub async fn lock_chain_config(conn: &mut PgConnection, config_id: i64) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("cadence:config:{config_id}"))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Number of runs of `config_id` currently in `STARTED`.
pub async fn count_running(conn: &mut PgConnection, config_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM timetable.run_status
         WHERE chain_execution_config = $1 AND execution_status = 'STARTED'",
    )
    .bind(config_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Insert a `STARTED` row and return its id.
pub async fn insert_run(
    conn: &mut PgConnection,
    config_id: i64,
    chain_id: i64,
    client_name: &str,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO timetable.run_status
             (chain_id, chain_execution_config, client_name, execution_status,
              started, last_status_update)
         VALUES ($1, $2, $3, 'STARTED', now(), now())
         RETURNING run_status",
    )
    .bind(chain_id)
    .bind(config_id)
    .bind(client_name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Record which element a run is executing.
pub async fn update_current_element(conn: &mut PgConnection, run_id: i64, chain_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE timetable.run_status
         SET current_execution_element = $2, last_status_update = clock_timestamp()
         WHERE run_status = $1",
    )
    .bind(run_id)
    .bind(chain_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move a `STARTED` run to a terminal state.
///
/// Returns false when the row was no longer `STARTED` (for example already
/// closed by crash recovery); the earlier terminal state is kept.
pub async fn finalize_run(
    conn: &mut PgConnection,
    run_id: i64,
    state: RunState,
    error: Option<&str>,
) -> Result<bool> {
    debug_assert!(state.is_terminal());
    let res = sqlx::query(
        "UPDATE timetable.run_status
         SET execution_status = $2::timetable.execution_status, finished = clock_timestamp(),
             last_status_update = clock_timestamp(), error = $3
         WHERE run_status = $1 AND execution_status = 'STARTED'",
    )
    .bind(run_id)
    .bind(state.as_str())
    .bind(error)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// All `STARTED` rows claimed under `client_name`.
pub async fn started_runs(conn: &mut PgConnection, client_name: &str) -> Result<Vec<RunStatusRow>> {
    let rows = sqlx::query_as::<_, RunStatusRow>(
        "SELECT run_status, chain_execution_config, chain_id,
                execution_status::text AS execution_status
         FROM timetable.run_status
         WHERE client_name = $1 AND execution_status = 'STARTED'
         ORDER BY run_status",
    )
    .bind(client_name)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Close the given runs as `CRASHED`; returns the rows that actually changed.
pub async fn mark_crashed(conn: &mut PgConnection, run_ids: &[i64]) -> Result<Vec<RunStatusRow>> {
    if run_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, RunStatusRow>(
        "UPDATE timetable.run_status
         SET execution_status = 'CRASHED', finished = clock_timestamp(),
             last_status_update = clock_timestamp(),
             error = 'scheduler stopped before the run finished'
         WHERE run_status = ANY($1) AND execution_status = 'STARTED'
         RETURNING run_status, chain_execution_config, chain_id,
                   execution_status::text AS execution_status",
    )
    .bind(run_ids)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}
