//! Steps that run against a database other than the configuration store.
//!
//! A remote connection is opened right before the step, used for exactly one
//! transaction and closed right after. Nothing here is pooled.

use std::collections::BTreeMap;

use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{Connection, Postgres, Transaction};
use tracing::debug;

use crate::error::{PgEngineError, Result};

/// Look up the connect string of a `timetable.database_connection` row.
pub async fn resolve_connection_string(conn: &mut PgConnection, connection_id: i64) -> Result<String> {
    let connect_string: Option<Option<String>> = sqlx::query_scalar(
        "SELECT connect_string FROM timetable.database_connection
         WHERE database_connection = $1",
    )
    .bind(connection_id)
    .fetch_optional(&mut *conn)
    .await?;

    match connect_string.flatten() {
        Some(s) if !s.trim().is_empty() => Ok(s),
        Some(_) => Err(PgEngineError::MalformedConnection(format!(
            "database_connection {connection_id} has an empty connect string"
        ))),
        None => Err(PgEngineError::MalformedConnection(format!(
            "database_connection {connection_id} does not exist"
        ))),
    }
}

/// Parse a connect string: either a `postgres://` URL or a libpq
/// keyword/value list such as `host='db' port=5432 dbname='x'`.
pub fn parse_connect_options(connect_string: &str) -> Result<PgConnectOptions> {
    let trimmed = connect_string.trim();
    if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
        return trimmed
            .parse::<PgConnectOptions>()
            .map_err(|e| PgEngineError::MalformedConnection(e.to_string()));
    }

    let pairs = parse_dsn(trimmed)?;
    let mut options = PgConnectOptions::new();
    for (key, value) in &pairs {
        options = match key.as_str() {
            "host" | "hostaddr" => options.host(value),
            "port" => options.port(value.parse().map_err(|_| {
                PgEngineError::MalformedConnection(format!("invalid port: {value}"))
            })?),
            "dbname" => options.database(value),
            "user" => options.username(value),
            "password" => options.password(value),
            "application_name" => options.application_name(value),
            "sslmode" => options.ssl_mode(value.parse::<PgSslMode>().map_err(|_| {
                PgEngineError::MalformedConnection(format!("invalid sslmode: {value}"))
            })?),
            other => {
                debug!(keyword = other, "ignoring unsupported connect keyword");
                options
            }
        };
    }
    Ok(options)
}

/// Split a libpq keyword/value string into its pairs.
///
/// Values may be single-quoted; inside quotes `\'` and `\\` are escapes.
pub fn parse_dsn(dsn: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    let mut chars = dsn.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(PgEngineError::MalformedConnection(format!(
                "missing '=' after \"{key}\""
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => {
                            return Err(PgEngineError::MalformedConnection(format!(
                                "unterminated quoted value for \"{key}\""
                            )))
                        }
                    },
                    Some(c) => value.push(c),
                    None => {
                        return Err(PgEngineError::MalformedConnection(format!(
                            "unterminated quoted value for \"{key}\""
                        )))
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }

        if key.is_empty() {
            return Err(PgEngineError::MalformedConnection(
                "empty keyword".to_string(),
            ));
        }
        pairs.insert(key, value);
    }

    if pairs.is_empty() {
        return Err(PgEngineError::MalformedConnection(
            "empty connect string".to_string(),
        ));
    }
    Ok(pairs)
}

/// A dedicated connection to a remote target database.
pub struct RemoteDatabase {
    conn: PgConnection,
}

impl RemoteDatabase {
    /// Open a fresh connection for one step.
    pub async fn open(connect_string: &str) -> Result<Self> {
        let options = parse_connect_options(connect_string)?;
        let conn = PgConnection::connect_with(&options).await?;
        debug!("remote connection opened");
        Ok(Self { conn })
    }

    /// Start the step's transaction on the remote side.
    pub async fn begin(&mut self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.conn.begin().await?)
    }

    pub async fn close(self) -> Result<()> {
        self.conn.close().await?;
        debug!("remote connection closed");
        Ok(())
    }
}

/// Narrow the session's privileges to `role` for the rest of the transaction.
pub async fn set_role(conn: &mut PgConnection, role: &str) -> Result<()> {
    // SET ROLE takes an identifier, not a bind parameter.
    let stmt = format!("SET ROLE {}", quote_ident(role));
    sqlx::query(&stmt).execute(&mut *conn).await?;
    debug!(role, "session role switched");
    Ok(())
}

/// Restore the session's original role.
pub async fn reset_role(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("RESET ROLE").execute(&mut *conn).await?;
    Ok(())
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
