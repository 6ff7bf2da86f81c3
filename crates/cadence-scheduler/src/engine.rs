use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Acquire, PgConnection, Postgres, Transaction};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cadence_core::{DispatchMode, LogLevel, RunState, SchedulerConfig, TaskKind};
use cadence_pgengine::{
    chain,
    command::execute_sql_command,
    recovery::{fix_scheduler_crash, reconnect_and_fix_leftovers},
    remote::{self, RemoteDatabase},
    run_status, store, ChainConfig, ChainElement, DbLogger, ExecutionRecord, IdentityLock,
    PgEngineError, RetryPolicy, Store,
};
use cadence_tasks::TaskRegistry;

use crate::{
    active::ActiveRuns,
    eligibility::{can_proceed_chain_execution, effective_max_instances, max_parallel_chains},
    error::{Result, SchedulerError},
    program::execute_program,
    steps::{run_steps, ChainOutcome, StepExecutor},
};

/// Everything a chain run needs, passed explicitly instead of held in globals.
pub struct EngineContext {
    pub store: Store,
    pub logger: DbLogger,
    pub tasks: Arc<TaskRegistry>,
    pub config: SchedulerConfig,
}

impl EngineContext {
    pub fn new(
        store: Store,
        logger: DbLogger,
        tasks: Arc<TaskRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            logger,
            tasks,
            config,
        }
    }

    pub fn client_name(&self) -> &str {
        &self.config.client_name
    }
}

/// Poll loop: discovers due chain configs and runs them until shutdown.
///
/// Owns the identity lock while running so it can check, after a store
/// outage, that the identity is still ours.
pub struct SchedulerEngine {
    ctx: Arc<EngineContext>,
    lock: IdentityLock,
    active: ActiveRuns,
    /// Set by chain tasks that saw the store connection drop.
    store_lost: Arc<AtomicBool>,
    /// One permit per chain allowed to hold a store transaction at a time.
    slots: Arc<Semaphore>,
}

impl SchedulerEngine {
    pub fn new(ctx: EngineContext, lock: IdentityLock) -> Self {
        let slots = max_parallel_chains(ctx.store.max_connections());
        Self {
            ctx: Arc::new(ctx),
            lock,
            active: ActiveRuns::new(),
            store_lost: Arc::new(AtomicBool::new(false)),
            slots: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Main event loop. Polls every `poll_interval_secs` until `shutdown`
    /// broadcasts `true`, then waits for in-flight chains.
    ///
    /// Hands the identity lock back on a clean stop. Fails when the store
    /// stays unreachable or the identity was taken over.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<IdentityLock> {
        info!(
            client = %self.ctx.client_name(),
            mode = ?self.ctx.config.dispatch_mode,
            poll_secs = self.ctx.config.poll_interval_secs,
            parallel_chains = self.slots.available_permits(),
            "scheduler engine started"
        );
        self.ctx
            .logger
            .log_to_db(LogLevel::Log, "Scheduler engine started")
            .await;

        let period = Duration::from_secs(self.ctx.config.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut chains: JoinSet<()> = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&mut chains).await {
                        break Err(e);
                    }
                }
                Some(joined) = chains.join_next(), if !chains.is_empty() => {
                    if let Err(e) = joined {
                        error!("chain task ended abnormally: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break Ok(());
                    }
                }
            }
        };

        self.drain(chains).await;
        match outcome {
            Ok(()) => {
                self.ctx
                    .logger
                    .log_to_db(LogLevel::Log, "Scheduler engine stopped")
                    .await;
                Ok(self.lock)
            }
            Err(e) => Err(e),
        }
    }

    // --- private helpers ---------------------------------------------------

    async fn tick(&mut self, chains: &mut JoinSet<()>) -> Result<()> {
        if self.store_lost.swap(false, Ordering::SeqCst) {
            self.recover_store().await?;
        }

        let Err(e) = self.poll_once(chains).await else {
            return Ok(());
        };
        if store_is_lost(&self.ctx.store, &e).await {
            warn!("store connection lost during poll: {e}");
            return self.recover_store().await;
        }
        self.ctx
            .logger
            .log_to_db(LogLevel::Error, &format!("Poll pass failed: {e}"))
            .await;
        Ok(())
    }

    /// One discovery pass: claim and run every due config.
    ///
    /// Concurrent chains wait for a free slot before claiming, so queued
    /// configs never hold a store connection.
    async fn poll_once(&mut self, chains: &mut JoinSet<()>) -> Result<()> {
        let configs =
            chain::due_chain_configs(self.ctx.store.pool(), self.ctx.client_name()).await?;
        if configs.is_empty() {
            debug!("no chain configs due");
            return Ok(());
        }
        debug!(
            count = configs.len(),
            free_slots = self.slots.available_permits(),
            "chain configs due"
        );

        for config in configs {
            match self.ctx.config.dispatch_mode {
                DispatchMode::Concurrent => {
                    let ctx = Arc::clone(&self.ctx);
                    let active = self.active.clone();
                    let store_lost = Arc::clone(&self.store_lost);
                    let slots = Arc::clone(&self.slots);
                    chains.spawn(async move {
                        // The semaphore is never closed.
                        let Ok(_slot) = slots.acquire_owned().await else {
                            return;
                        };
                        supervise_chain(&ctx, &active, &store_lost, config).await;
                    });
                }
                DispatchMode::Serial => {
                    supervise_chain(&self.ctx, &self.active, &self.store_lost, config).await;
                    if self.store_lost.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait for the store, close leftovers, and make sure the identity is
    /// still ours.
    async fn recover_store(&mut self) -> Result<()> {
        let policy = RetryPolicy::reconnect(&self.ctx.config);
        {
            let live = self.active.read().await;
            if let Err(e) =
                reconnect_and_fix_leftovers(&self.ctx.store, &self.ctx.logger, &live, policy).await
            {
                self.ctx
                    .logger
                    .log_to_db(LogLevel::Panic, &format!("Giving up on the store: {e}"))
                    .await;
                return Err(e.into());
            }
        }
        self.ensure_identity_lock().await
    }

    async fn ensure_identity_lock(&mut self) -> Result<()> {
        if self.lock.is_alive().await {
            return Ok(());
        }
        warn!(client = %self.ctx.client_name(), "identity lock connection lost, re-acquiring");

        match IdentityLock::try_acquire(self.ctx.store.connect_options(), self.ctx.client_name())
            .await?
        {
            Some(lock) => {
                self.lock = lock;
                self.ctx
                    .logger
                    .log_to_db(LogLevel::Log, "Identity lock re-acquired after reconnect")
                    .await;
                Ok(())
            }
            None => {
                self.ctx
                    .logger
                    .log_to_db(
                        LogLevel::Panic,
                        "Another scheduler took over this client name while the store was unreachable",
                    )
                    .await;
                Err(SchedulerError::LockLost {
                    client_name: self.ctx.client_name().to_string(),
                })
            }
        }
    }

    async fn drain(&self, mut chains: JoinSet<()>) {
        if chains.is_empty() {
            return;
        }
        info!(in_flight = chains.len(), "waiting for running chains");

        let grace = Duration::from_secs(self.ctx.config.shutdown_grace_secs);
        let all_done = tokio::time::timeout(grace, async {
            while chains.join_next().await.is_some() {}
        })
        .await;
        if all_done.is_ok() {
            return;
        }

        warn!(remaining = chains.len(), "shutdown grace elapsed, aborting running chains");
        chains.abort_all();
        while chains.join_next().await.is_some() {}

        // Nothing is live any more; close what the aborted chains left behind.
        if let Err(e) =
            fix_scheduler_crash(&self.ctx.store, &self.ctx.logger, &HashSet::new()).await
        {
            warn!("could not close aborted runs: {e}");
        }
    }
}

/// Whether `err` means the store is gone.
///
/// A pool acquire timeout only counts when a fresh connection fails too.
async fn store_is_lost(store: &Store, err: &SchedulerError) -> bool {
    if err.is_connection_lost() {
        return true;
    }
    if !err.is_pool_exhausted() {
        return false;
    }
    match store.check_reachable().await {
        Ok(()) => {
            warn!("store connection pool exhausted while the store is reachable");
            false
        }
        Err(e) => {
            warn!("store unreachable after pool timeout: {e}");
            true
        }
    }
}

/// Run one config and route its failure: store loss flags a reconnect,
/// anything else is logged against the config.
async fn supervise_chain(
    ctx: &EngineContext,
    active: &ActiveRuns,
    store_lost: &AtomicBool,
    config: ChainConfig,
) {
    let Err(e) = run_chain_config(ctx, active, &config).await else {
        return;
    };
    if store_is_lost(&ctx.store, &e).await {
        warn!(config_id = config.config_id, "store connection lost while running chain: {e}");
        store_lost.store(true, Ordering::SeqCst);
    } else {
        ctx.logger
            .log_to_db(
                LogLevel::Error,
                &format!(
                    "Chain config {} ({}) could not run: {e}",
                    config.config_id, config.chain_name
                ),
            )
            .await;
    }
}

/// Claim a run of `config` and execute it to a terminal state.
///
/// Returns the run id, or `None` when the config is at its instance limit.
/// Once a run is claimed, every failure other than a lost store connection
/// ends it as `FAILED`; after a lost connection it stays `STARTED` until
/// crash recovery closes it.
pub async fn run_chain_config(
    ctx: &EngineContext,
    active: &ActiveRuns,
    config: &ChainConfig,
) -> Result<Option<i64>> {
    let Some(run_id) = claim_run(ctx, active, config).await? else {
        ctx.logger
            .log_to_db(
                LogLevel::Notice,
                &format!(
                    "Cannot proceed with chain config {} ({}): instance limit reached",
                    config.config_id, config.chain_name
                ),
            )
            .await;
        return Ok(None);
    };

    let result = execute_claimed_run(ctx, config, run_id).await;
    active.finish(run_id).await;
    result.map(|()| Some(run_id))
}

/// Check eligibility and insert the `STARTED` row in one short transaction,
/// serialized per config by an advisory transaction lock.
async fn claim_run(
    ctx: &EngineContext,
    active: &ActiveRuns,
    config: &ChainConfig,
) -> Result<Option<i64>> {
    let mut live = active.claim().await;
    let mut tx = ctx.store.begin().await?;

    run_status::lock_chain_config(&mut tx, config.config_id).await?;
    let running = run_status::count_running(&mut tx, config.config_id).await?;
    if !can_proceed_chain_execution(running, effective_max_instances(config)) {
        debug!(config_id = config.config_id, running, "instance limit reached");
        tx.rollback().await?;
        return Ok(None);
    }

    let run_id =
        run_status::insert_run(&mut tx, config.config_id, config.chain_id, ctx.client_name())
            .await?;
    tx.commit().await?;
    live.insert(run_id);
    debug!(config_id = config.config_id, run_id, "run claimed");
    Ok(Some(run_id))
}

async fn execute_claimed_run(ctx: &EngineContext, config: &ChainConfig, run_id: i64) -> Result<()> {
    ctx.logger
        .log_to_db(
            LogLevel::Log,
            &format!(
                "Starting chain {} (config {}, run {run_id})",
                config.chain_name, config.config_id
            ),
        )
        .await;

    let (state, detail) = terminal_state(run_elements(ctx, config, run_id).await)?;
    close_run(ctx, config, run_id, state, detail).await
}

/// The state a claimed run ends in.
///
/// A lost store connection is passed through instead: the row stays
/// `STARTED` and recovery closes it once the store is back.
fn terminal_state(result: Result<Option<String>>) -> Result<(RunState, Option<String>)> {
    match result {
        Ok(None) => Ok((RunState::Done, None)),
        Ok(Some(detail)) => Ok((RunState::Failed, Some(detail))),
        Err(e) if e.is_connection_lost() => Err(e),
        Err(e) => Ok((RunState::Failed, Some(format!("chain could not run: {e}")))),
    }
}

/// Execute every element inside one local transaction.
///
/// `Ok(None)` when the chain completed, `Ok(Some(detail))` when it failed.
async fn run_elements(
    ctx: &EngineContext,
    config: &ChainConfig,
    run_id: i64,
) -> Result<Option<String>> {
    let mut tx = ctx.store.begin().await?;
    let elements = chain::chain_elements(&mut tx, config.chain_id).await?;

    let mut run = ChainRun::new(ctx, config.config_id, run_id, tx);
    let outcome = match run_steps(&mut run, &elements, &ctx.logger).await {
        ChainOutcome::Failed { error, .. } if error.is_connection_lost() => return Err(error),
        other => other,
    };

    let detail = outcome.error_detail();
    match run.tx.commit().await {
        Ok(()) => Ok(detail),
        Err(e) if store::is_connection_error(&e) => Err(e.into()),
        Err(e) => Ok(Some(match detail {
            None => format!("commit failed: {e}"),
            Some(detail) => format!("{detail}; commit failed: {e}"),
        })),
    }
}

/// Move the run to its terminal state, then apply self-destruct and log the
/// result.
async fn close_run(
    ctx: &EngineContext,
    config: &ChainConfig,
    run_id: i64,
    state: RunState,
    detail: Option<String>,
) -> Result<()> {
    let mut conn = ctx.store.pool().acquire().await?;
    let (state, detail) =
        match run_status::finalize_run(&mut conn, run_id, state, detail.as_deref()).await {
            Ok(true) => (state, detail),
            Ok(false) => {
                warn!(run_id, "run was already closed before it finished");
                (state, detail)
            }
            Err(e) if e.is_connection_lost() => return Err(e.into()),
            Err(e) => {
                // Still close the run so it does not count against the config.
                let detail = format!("could not record {state}: {e}");
                run_status::finalize_run(&mut conn, run_id, RunState::Failed, Some(&detail))
                    .await?;
                (RunState::Failed, Some(detail))
            }
        };

    if state == RunState::Done && config.self_destruct {
        match chain::disable_chain_config(&mut conn, config.config_id).await {
            Ok(true) => {
                ctx.logger
                    .log_to_db(
                        LogLevel::Log,
                        &format!("Chain config {} self-destructed", config.config_id),
                    )
                    .await
            }
            Ok(false) => {}
            Err(e) => {
                ctx.logger
                    .log_to_db(
                        LogLevel::Error,
                        &format!("Chain config {} could not self-destruct: {e}", config.config_id),
                    )
                    .await
            }
        }
    }
    drop(conn);

    match detail {
        None => {
            ctx.logger
                .log_to_db(
                    LogLevel::Log,
                    &format!("Chain {} (run {run_id}) finished", config.chain_name),
                )
                .await
        }
        Some(detail) => {
            ctx.logger
                .log_to_db(
                    LogLevel::Error,
                    &format!("Chain {} (run {run_id}) failed: {detail}", config.chain_name),
                )
                .await
        }
    }
    Ok(())
}

/// One chain run in progress. Owns its local transaction and handles on the
/// shared store, logger and registry.
struct ChainRun {
    store: Store,
    logger: DbLogger,
    tasks: Arc<TaskRegistry>,
    client_name: String,
    config_id: i64,
    run_id: i64,
    tx: Transaction<'static, Postgres>,
}

impl ChainRun {
    fn new(
        ctx: &EngineContext,
        config_id: i64,
        run_id: i64,
        tx: Transaction<'static, Postgres>,
    ) -> Self {
        Self {
            store: ctx.store.clone(),
            logger: ctx.logger.clone(),
            tasks: Arc::clone(&ctx.tasks),
            client_name: ctx.client_name().to_string(),
            config_id,
            run_id,
            tx,
        }
    }
}

#[async_trait]
impl StepExecutor for ChainRun {
    async fn execute(&mut self, element: &ChainElement) -> Result<()> {
        let started_at = Utc::now();
        let result = self.dispatch(element).await;
        let record = ExecutionRecord {
            config_id: self.config_id,
            chain_id: element.chain_id,
            task_id: element.task_id,
            name: element.task_name.clone(),
            script: element.script.clone(),
            started_at,
            finished_at: Utc::now(),
            return_code: result.as_ref().map_or_else(SchedulerError::return_code, |_| 0),
        };

        // Written through the pool so the row survives a chain rollback.
        let pool = self.store.pool().clone();
        if let Err(e) = chain::log_element_execution(&pool, &self.client_name, &record).await {
            if e.is_connection_lost() {
                return Err(e.into());
            }
            warn!(chain_id = element.chain_id, "could not write execution log: {e}");
        }
        result
    }
}

impl ChainRun {
    async fn dispatch(&mut self, element: &ChainElement) -> Result<()> {
        {
            let pool = self.store.pool().clone();
            let mut conn = pool.acquire().await?;
            run_status::update_current_element(&mut conn, self.run_id, element.chain_id).await?;
        }
        let params =
            chain::chain_param_values(&mut self.tx, self.config_id, element.chain_id).await?;

        let logger = self.logger.clone();
        logger
            .log_to_db(
                LogLevel::Debug,
                &format!(
                    "Executing element {} ({}) of kind {} with {} parameter value(s)",
                    element.chain_id,
                    element.task_name,
                    element.kind,
                    params.len()
                ),
            )
            .await;

        match element.kind {
            TaskKind::Sql => match element.database_connection {
                None => self.local_sql(element, &params).await,
                Some(connection_id) => self.remote_sql(connection_id, element, &params).await,
            },
            TaskKind::Program => {
                note_unused_targets(&logger, element).await;
                let outputs = execute_program(&element.script, &params).await?;
                for output in outputs.into_iter().filter(|o| !o.is_empty()) {
                    logger
                        .log_to_db(
                            LogLevel::Log,
                            &format!("Output of {}: {output}", element.task_name),
                        )
                        .await;
                }
                Ok(())
            }
            TaskKind::Builtin => {
                note_unused_targets(&logger, element).await;
                let tasks = Arc::clone(&self.tasks);
                tasks.execute(&element.task_name, &params).await?;
                Ok(())
            }
        }
    }

    /// Run inside a savepoint of the chain transaction. A failure rolls back
    /// only this step.
    async fn local_sql(&mut self, element: &ChainElement, params: &[String]) -> Result<()> {
        let mut savepoint = Acquire::begin(&mut *self.tx).await?;
        match run_sql_step(&mut savepoint, element, params).await {
            Ok(()) => {
                savepoint.commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = savepoint.rollback().await {
                    if store::is_connection_error(&rollback) {
                        return Err(rollback.into());
                    }
                    warn!(chain_id = element.chain_id, "savepoint rollback failed: {rollback}");
                }
                Err(e.into())
            }
        }
    }

    /// Run on a dedicated connection to the element's remote target.
    async fn remote_sql(
        &mut self,
        connection_id: i64,
        element: &ChainElement,
        params: &[String],
    ) -> Result<()> {
        let connect_string = remote::resolve_connection_string(&mut self.tx, connection_id).await?;
        let remote_error = move |e: PgEngineError| SchedulerError::Remote {
            connection_id,
            reason: e.to_string(),
        };

        let mut db = RemoteDatabase::open(&connect_string)
            .await
            .map_err(remote_error)?;
        let result = run_remote_step(&mut db, element, params)
            .await
            .map_err(remote_error);
        if let Err(e) = db.close().await {
            warn!(connection_id, "closing remote connection failed: {e}");
        }
        result
    }
}

async fn note_unused_targets(logger: &DbLogger, element: &ChainElement) {
    if element.run_uid.is_some() || element.database_connection.is_some() {
        logger
            .log_to_db(
                LogLevel::Debug,
                &format!(
                    "Element {} is {}: run_uid and database_connection are ignored",
                    element.chain_id, element.kind
                ),
            )
            .await;
    }
}

async fn run_remote_step(
    db: &mut RemoteDatabase,
    element: &ChainElement,
    params: &[String],
) -> cadence_pgengine::Result<()> {
    let mut tx = db.begin().await?;
    match run_sql_step(&mut tx, element, params).await {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(chain_id = element.chain_id, "remote rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}

/// Execute an SQL element on `conn`, switching to `run_uid` when set.
async fn run_sql_step(
    conn: &mut PgConnection,
    element: &ChainElement,
    params: &[String],
) -> cadence_pgengine::Result<()> {
    match element.run_uid.as_deref().filter(|role| !role.trim().is_empty()) {
        Some(role) => {
            remote::set_role(conn, role).await?;
            execute_sql_command(conn, &element.script, params).await?;
            remote::reset_role(conn).await
        }
        None => execute_sql_command(conn, &element.script, params).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_and_failed_chains_map_to_terminal_states() {
        let (state, detail) = terminal_state(Ok(None)).unwrap();
        assert_eq!(state, RunState::Done);
        assert!(detail.is_none());

        let (state, detail) = terminal_state(Ok(Some("element 3 failed".into()))).unwrap();
        assert_eq!(state, RunState::Failed);
        assert_eq!(detail.as_deref(), Some("element 3 failed"));
    }

    #[test]
    fn errors_outside_the_steps_still_fail_the_run() {
        let decode = sqlx::Error::ColumnNotFound("kind".into());
        let (state, detail) = terminal_state(Err(decode.into())).unwrap();
        assert_eq!(state, RunState::Failed);
        assert!(detail.unwrap().contains("kind"));

        let busy = sqlx::Error::PoolTimedOut;
        let (state, _) = terminal_state(Err(busy.into())).unwrap();
        assert_eq!(state, RunState::Failed);
    }

    #[test]
    fn lost_store_leaves_the_run_for_recovery() {
        let err = terminal_state(Err(sqlx::Error::PoolClosed.into())).unwrap_err();
        assert!(err.is_connection_lost());
    }
}
