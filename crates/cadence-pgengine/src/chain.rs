//! Read side of chain definitions plus the one config mutation the engine makes.

use sqlx::postgres::PgConnection;
use sqlx::PgPool;

use cadence_core::config::DEFAULT_MAX_INSTANCES;

use crate::error::Result;
use crate::types::{ChainConfig, ChainElement, ExecutionRecord};

/// Live configs assigned to `client_name` (or to nobody) whose schedule matches now.
///
/// Schedule matching is delegated to the store function `timetable.check_task`.
pub async fn due_chain_configs(pool: &PgPool, client_name: &str) -> Result<Vec<ChainConfig>> {
    let configs = sqlx::query_as::<_, ChainConfig>(
        "SELECT chain_execution_config, chain_id, chain_name, self_destruct,
                exclusive_execution, COALESCE(max_instances, $2) AS max_instances
         FROM timetable.chain_execution_config
         WHERE live
           AND (client_name IS NULL OR client_name = $1)
           AND timetable.check_task(chain_execution_config)
         ORDER BY chain_execution_config",
    )
    .bind(client_name)
    .bind(DEFAULT_MAX_INSTANCES)
    .fetch_all(pool)
    .await?;
    Ok(configs)
}

/// Elements of the chain headed by `chain_id`, ordered head first.
///
/// Elements are linked through `parent_id`; the order is the depth in that list.
pub async fn chain_elements(conn: &mut PgConnection, chain_id: i64) -> Result<Vec<ChainElement>> {
    let elements = sqlx::query_as::<_, ChainElement>(
        "WITH RECURSIVE x (chain_id, task_id, task_name, script, kind, run_uid,
                           ignore_error, database_connection, step_order) AS (
             SELECT tc.chain_id, tc.task_id, bt.name, COALESCE(bt.script, ''), bt.kind::text,
                    tc.run_uid, tc.ignore_error, tc.database_connection, 0
             FROM timetable.task_chain tc
             JOIN timetable.base_task bt USING (task_id)
             WHERE tc.parent_id IS NULL AND tc.chain_id = $1
             UNION ALL
             SELECT tc.chain_id, tc.task_id, bt.name, COALESCE(bt.script, ''), bt.kind::text,
                    tc.run_uid, tc.ignore_error, tc.database_connection, x.step_order + 1
             FROM timetable.task_chain tc
             JOIN timetable.base_task bt USING (task_id)
             JOIN x ON x.chain_id = tc.parent_id
         )
         SELECT * FROM x ORDER BY step_order",
    )
    .bind(chain_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(elements)
}

/// Parameter sets bound to one element under one config, in `order_id` order.
pub async fn chain_param_values(
    conn: &mut PgConnection,
    config_id: i64,
    chain_id: i64,
) -> Result<Vec<String>> {
    let values = sqlx::query_scalar::<_, String>(
        "SELECT COALESCE(value::text, '')
         FROM timetable.chain_execution_parameters
         WHERE chain_execution_config = $1 AND chain_id = $2
         ORDER BY order_id ASC",
    )
    .bind(config_id)
    .bind(chain_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(values)
}

/// Clear `live` on a self-destructing config. Returns whether a row changed.
pub async fn disable_chain_config(conn: &mut PgConnection, config_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE timetable.chain_execution_config SET live = FALSE
         WHERE chain_execution_config = $1 AND live",
    )
    .bind(config_id)
    .execute(&mut *conn)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Append one row to `timetable.execution_log`.
///
/// The kind is copied from the base task so it keeps the store's own type.
pub async fn log_element_execution(
    pool: &PgPool,
    client_name: &str,
    record: &ExecutionRecord,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO timetable.execution_log
             (chain_execution_config, chain_id, task_id, name, script, kind,
              last_run, finished, returncode, pid, client_name)
         SELECT $1, $2, $3, $4, $5, bt.kind, $6, $7, $8, $9, $10
         FROM timetable.base_task bt WHERE bt.task_id = $3",
    )
    .bind(record.config_id)
    .bind(record.chain_id)
    .bind(record.task_id)
    .bind(&record.name)
    .bind(&record.script)
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(record.return_code)
    .bind(i64::from(std::process::id()))
    .bind(client_name)
    .execute(pool)
    .await?;
    Ok(())
}
