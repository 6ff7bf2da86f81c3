//! Repair of runs left `STARTED` by a scheduler that went away.

use std::collections::HashSet;

use tracing::info;

use cadence_core::{LogLevel, RunState};

use crate::error::{PgEngineError, Result};
use crate::logger::DbLogger;
use crate::retry::RetryPolicy;
use crate::run_status;
use crate::store::Store;
use crate::types::RunStatusRow;

/// Runs that must be closed as `CRASHED`.
///
/// Every `STARTED` row is a leftover unless a chain in this process is still
/// executing it. The identity lock guarantees no other live process shares
/// the client name, so "not live here" means "dead".
pub fn leftover_runs(rows: &[RunStatusRow], live: &HashSet<i64>) -> Vec<i64> {
    rows.iter()
        .filter(|row| row.state == RunState::Started && !live.contains(&row.run_id))
        .map(|row| row.run_id)
        .collect()
}

/// Close every leftover run of this client as `CRASHED`, logging each one.
///
/// Running it again without new leftovers changes nothing.
pub async fn fix_scheduler_crash(
    store: &Store,
    logger: &DbLogger,
    live: &HashSet<i64>,
) -> Result<usize> {
    let mut conn = store.pool().acquire().await?;
    let rows = run_status::started_runs(&mut conn, logger.client_name()).await?;
    let leftovers = leftover_runs(&rows, live);
    let crashed = run_status::mark_crashed(&mut conn, &leftovers).await?;
    drop(conn);

    for row in &crashed {
        logger
            .log_to_db(
                LogLevel::Log,
                &format!(
                    "Run {} of chain config {} (chain {}) was left unfinished and is marked CRASHED",
                    row.run_id, row.config_id, row.chain_id
                ),
            )
            .await;
    }
    if !crashed.is_empty() {
        info!(count = crashed.len(), "leftover runs closed");
    }
    Ok(crashed.len())
}

/// Wait for the store to come back, then repair leftovers.
///
/// Gives up with [`PgEngineError::ReconnectExhausted`] after the policy's
/// attempts.
pub async fn reconnect_and_fix_leftovers(
    store: &Store,
    logger: &DbLogger,
    live: &HashSet<i64>,
    policy: RetryPolicy,
) -> Result<usize> {
    policy
        .run("store reconnect", || store.check_reachable())
        .await
        .map_err(|(attempts, e)| PgEngineError::ReconnectExhausted {
            attempts,
            last_error: e.to_string(),
        })?;

    logger
        .log_to_db(LogLevel::Log, "Connection to the store reestablished")
        .await;
    fix_scheduler_crash(store, logger, live).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(run_id: i64, state: RunState) -> RunStatusRow {
        RunStatusRow {
            run_id,
            config_id: 10,
            chain_id: 100,
            state,
        }
    }

    #[test]
    fn every_started_row_is_a_leftover_at_startup() {
        let rows = vec![row(1, RunState::Started), row(2, RunState::Started)];
        assert_eq!(leftover_runs(&rows, &HashSet::new()), vec![1, 2]);
    }

    #[test]
    fn live_runs_are_left_alone() {
        let rows = vec![row(1, RunState::Started), row(2, RunState::Started)];
        let live: HashSet<i64> = [2].into_iter().collect();
        assert_eq!(leftover_runs(&rows, &live), vec![1]);
    }

    #[test]
    fn terminal_rows_are_never_leftovers() {
        let rows = vec![
            row(1, RunState::Done),
            row(2, RunState::Failed),
            row(3, RunState::Crashed),
        ];
        assert!(leftover_runs(&rows, &HashSet::new()).is_empty());
    }

    #[test]
    fn second_pass_over_repaired_rows_is_empty() {
        let before = vec![row(1, RunState::Started)];
        let repaired: Vec<_> = leftover_runs(&before, &HashSet::new())
            .into_iter()
            .map(|id| row(id, RunState::Crashed))
            .collect();
        assert!(leftover_runs(&repaired, &HashSet::new()).is_empty());
    }
}
