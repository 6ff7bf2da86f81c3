use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use cadence_core::{CadenceConfig, LogLevel, SchedulerConfig};
use cadence_pgengine::{recovery::fix_scheduler_crash, DbLogger, IdentityLock, Store};
use cadence_scheduler::{EngineContext, SchedulerEngine};
use cadence_tasks::TaskRegistry;

/// Run scheduled job chains stored in a PostgreSQL `timetable` schema.
#[derive(Debug, Parser)]
#[command(name = "cadence", version, about, long_about = None)]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, short = 'f')]
    config: Option<String>,

    /// Identity of this scheduler; overrides scheduler.client_name
    #[arg(long, short = 'c', env = "CADENCE_CLIENT_NAME")]
    client_name: Option<String>,

    /// Persist DEBUG, NOTICE and LOG rows as well as errors
    #[arg(long, short = 'v')]
    verbose: bool,
}

impl Cli {
    /// Command-line flags win over file and environment settings.
    fn apply(&self, config: &mut CadenceConfig) {
        if let Some(name) = &self.client_name {
            config.scheduler.client_name = name.clone();
        }
        if self.verbose {
            config.scheduler.verbose = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // load config: explicit path > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let mut config =
        CadenceConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate()?;
    let client_name = config.scheduler.client_name.clone();

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(
        host = %config.database.host,
        dbname = %config.database.dbname,
        client = %client_name,
        "connecting to the store"
    );
    let store = Store::connect(&config.database, &config.scheduler)
        .await
        .context("connecting to the store")?;
    store.verify_schema().await?;
    let logger = DbLogger::new(&store, client_name.clone(), config.scheduler.verbose);

    let lock = match acquire_identity(&store, &logger, &config.scheduler, &mut shutdown_rx).await
    {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            store.close().await;
            return Ok(());
        }
        Err(e) => {
            store.close().await;
            return Err(e);
        }
    };

    // Nothing runs yet, so every STARTED row of this identity is a leftover.
    let repaired = fix_scheduler_crash(&store, &logger, &HashSet::new()).await?;
    info!(repaired, "startup recovery finished");

    let tasks = Arc::new(TaskRegistry::with_builtins(Arc::new(logger.clone())));
    let ctx = EngineContext::new(store.clone(), logger.clone(), tasks, config.scheduler.clone());
    let engine = SchedulerEngine::new(ctx, lock);

    let outcome = engine.run(shutdown_rx).await;
    let result = match outcome {
        Ok(lock) => {
            if let Err(e) = lock.release().await {
                warn!("releasing the identity lock failed: {e}");
            }
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("scheduler engine stopped")),
    };

    store.close().await;
    info!("cadence stopped");
    result
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "cadence_daemon=debug,cadence_scheduler=debug,cadence_pgengine=debug,cadence_tasks=debug"
    } else {
        "cadence_daemon=info,cadence_scheduler=info,cadence_pgengine=info,cadence_tasks=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

/// Claim the client identity.
///
/// With `lock_wait_secs = 0` a taken identity is fatal; otherwise retry at
/// that period until the lock is ours or a shutdown arrives (`Ok(None)`).
async fn acquire_identity(
    store: &Store,
    logger: &DbLogger,
    config: &SchedulerConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<Option<IdentityLock>> {
    loop {
        if let Some(lock) =
            IdentityLock::try_acquire(store.connect_options(), &config.client_name).await?
        {
            return Ok(Some(lock));
        }

        let message = format!(
            "Another scheduler is already running as '{}'",
            config.client_name
        );
        if config.lock_wait_secs == 0 {
            logger.log_to_db(LogLevel::Error, &message).await;
            anyhow::bail!(message);
        }
        logger.log_to_db(LogLevel::Log, &format!("{message}; waiting")).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.lock_wait_secs)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutdown requested while waiting for the identity lock");
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
