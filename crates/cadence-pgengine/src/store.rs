use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use tracing::{debug, info};

use cadence_core::config::SslMode;
use cadence_core::{DatabaseConfig, SchedulerConfig};

use crate::error::{PgEngineError, Result};
use crate::retry::RetryPolicy;

/// Tables of the timetable schema the engine reads or writes.
pub const TIMETABLE_TABLES: [&str; 8] = [
    "database_connection",
    "base_task",
    "task_chain",
    "chain_execution_config",
    "chain_execution_parameters",
    "log",
    "execution_log",
    "run_status",
];

/// Handle on the configuration store.
///
/// Cheap to clone: the pool is reference counted and shared process-wide.
/// Every chain run takes its own transaction from it.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    options: PgConnectOptions,
}

impl Store {
    /// Connect to the store described by `db`, retrying with backoff.
    pub async fn connect(db: &DatabaseConfig, scheduler: &SchedulerConfig) -> Result<Self> {
        let options = connect_options(db, &scheduler.client_name);
        let policy = RetryPolicy::connect(scheduler);
        let max_connections = db.max_connections;

        let pool = policy
            .run("store connect", || {
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options.clone())
            })
            .await
            .map_err(|(attempts, e)| PgEngineError::ReconnectExhausted {
                attempts,
                last_error: e.to_string(),
            })?;

        info!(host = %db.host, port = db.port, dbname = %db.dbname, "connected to configuration store");
        Ok(Self { pool, options })
    }

    /// Wrap an existing pool; `options` are used for dedicated connections.
    pub fn from_parts(pool: PgPool, options: PgConnectOptions) -> Self {
        Self { pool, options }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Options for connections that must not come from the pool
    /// (the identity lock holder).
    pub fn connect_options(&self) -> &PgConnectOptions {
        &self.options
    }

    /// Open a local config-store transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Size of the pool; every running chain holds one connection of it.
    pub fn max_connections(&self) -> u32 {
        self.pool.options().get_max_connections()
    }

    /// Round trip on a fresh, unpooled connection.
    ///
    /// Tells a reachable server with a busy pool apart from a lost one.
    pub async fn check_reachable(&self) -> Result<()> {
        let mut conn = PgConnection::connect_with(&self.options).await?;
        conn.ping().await?;
        conn.close().await?;
        Ok(())
    }

    /// Check that every collaborator table exists.
    pub async fn verify_schema(&self) -> Result<()> {
        for table in TIMETABLE_TABLES {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(format!("timetable.{table}"))
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(PgEngineError::SchemaMissing(table.to_string()));
            }
        }
        debug!("timetable schema present");
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("configuration store connection closed");
    }
}

/// Build connect options for the store, tagging sessions with the client name.
pub fn connect_options(db: &DatabaseConfig, client_name: &str) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&db.host)
        .port(db.port)
        .database(&db.dbname)
        .username(&db.user)
        .ssl_mode(ssl_mode(db.sslmode))
        .application_name(client_name);
    if let Some(password) = &db.password {
        options = options.password(password);
    }
    options
}

pub(crate) fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

/// Whether `err` means the connection to the server is gone, as opposed to a
/// statement-level failure.
///
/// A pool acquire timeout is not included: the pool may just be busy. Callers
/// settle it with [`Store::check_reachable`].
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            // 08xxx connection exception, 57P0x operator intervention.
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P0")),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_and_closed_pool_mean_connection_lost() {
        let io = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_connection_error(&io));
        assert!(is_connection_error(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn busy_pool_is_not_a_lost_connection() {
        assert!(!is_connection_error(&sqlx::Error::PoolTimedOut));
        assert!(PgEngineError::Database(sqlx::Error::PoolTimedOut).is_pool_exhausted());
        assert!(!PgEngineError::Database(sqlx::Error::PoolTimedOut).is_connection_lost());
    }

    #[test]
    fn row_errors_are_not_connection_errors() {
        assert!(!is_connection_error(&sqlx::Error::RowNotFound));
        assert!(!is_connection_error(&sqlx::Error::ColumnNotFound(
            "x".to_string()
        )));
    }

    #[test]
    fn sslmode_maps_one_to_one() {
        assert!(matches!(ssl_mode(SslMode::Disable), PgSslMode::Disable));
        assert!(matches!(ssl_mode(SslMode::VerifyFull), PgSslMode::VerifyFull));
    }
}
