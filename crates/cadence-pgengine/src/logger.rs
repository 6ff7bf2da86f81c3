use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use cadence_core::{LogLevel, LogSink};

use crate::store::Store;

/// Writes operational log rows to `timetable.log`.
///
/// Every message is also emitted as a `tracing` event. Persistence is filtered
/// by [`LogLevel::is_persisted`]: a non-verbose scheduler only stores `ERROR`
/// and `PANIC` rows.
#[derive(Clone)]
pub struct DbLogger {
    pool: PgPool,
    client_name: String,
    verbose: bool,
    pid: i64,
}

impl DbLogger {
    pub fn new(store: &Store, client_name: impl Into<String>, verbose: bool) -> Self {
        Self {
            pool: store.pool().clone(),
            client_name: client_name.into(),
            verbose,
            pid: i64::from(std::process::id()),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// Emit `message` at `level` and persist it when the level passes the filter.
    ///
    /// A failed insert is reported to tracing only; logging never fails a chain.
    pub async fn log_to_db(&self, level: LogLevel, message: &str) {
        emit(&self.client_name, level, message);

        if !level.is_persisted(self.verbose) {
            return;
        }

        let res = sqlx::query(
            "INSERT INTO timetable.log (pid, client_name, log_level, message)
             VALUES ($1, $2, $3::timetable.log_type, $4)",
        )
        .bind(self.pid)
        .bind(&self.client_name)
        .bind(level.as_str())
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(e) = res {
            warn!(client = %self.client_name, level = %level, "could not persist log row: {e}");
        }
    }
}

#[async_trait]
impl LogSink for DbLogger {
    async fn log(&self, level: LogLevel, message: &str) {
        self.log_to_db(level, message).await;
    }
}

fn emit(client: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!(client, "{message}"),
        LogLevel::Notice | LogLevel::Log => info!(client, level = %level, "{message}"),
        LogLevel::Error => error!(client, "{message}"),
        LogLevel::Panic => error!(client, fatal = true, "{message}"),
    }
}
