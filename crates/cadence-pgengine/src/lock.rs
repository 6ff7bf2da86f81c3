use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Session-scoped advisory lock claiming a client identity in the store.
///
/// The lock lives exactly as long as its dedicated connection. Dropping the
/// guard closes the connection and the server releases the lock; `release`
/// does the same explicitly.
pub struct IdentityLock {
    conn: PgConnection,
    client_name: String,
}

impl IdentityLock {
    /// Try to claim `client_name` without blocking.
    ///
    /// `Ok(None)` means another live session already holds the identity.
    /// Contention is not an error; only store failures are.
    pub async fn try_acquire(options: &PgConnectOptions, client_name: &str) -> Result<Option<Self>> {
        let mut conn = PgConnection::connect_with(options).await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(client_name)
            .fetch_one(&mut conn)
            .await?;

        if !acquired {
            debug!(client = client_name, "identity lock held by another session");
            if let Err(e) = conn.close().await {
                warn!(client = client_name, "closing contended lock connection failed: {e}");
            }
            return Ok(None);
        }

        info!(client = client_name, "identity lock acquired");
        Ok(Some(Self {
            conn,
            client_name: client_name.to_string(),
        }))
    }

    /// Whether the connection holding the lock is still usable.
    ///
    /// A dead connection means the server has already released the lock.
    pub async fn is_alive(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    /// Unlock and close the owning connection.
    pub async fn release(self) -> Result<()> {
        let Self {
            mut conn,
            client_name,
        } = self;
        let unlocked: bool = sqlx::query_scalar("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(&client_name)
            .fetch_one(&mut conn)
            .await?;
        if !unlocked {
            warn!(client = %client_name, "identity lock was not held at release");
        }
        conn.close().await?;
        info!(client = %client_name, "identity lock released");
        Ok(())
    }
}
