use std::time::Duration;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Error as SqlxError,
};
use tracing::debug;

// Session timeouts sized for batch reads and bulk writes, not interactive traffic.
pub const DEFAULT_TIMEOUTS: DatabaseTimeouts = DatabaseTimeouts {
    statement_timeout: Duration::from_secs(60),
    lock_timeout: Duration::from_secs(5),
    acquire_timeout: Duration::from_secs(10),
    idle_timeout: Duration::from_secs(300),
    max_lifetime: Duration::from_secs(1800),
};

#[derive(Debug, Clone, Copy)]
pub struct DatabaseTimeouts {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

pub async fn get_pool(url: &str, max_connections: u32) -> Result<PgPool, SqlxError> {
    get_pool_with_timeouts(url, max_connections, DEFAULT_TIMEOUTS).await
}

pub async fn get_pool_with_timeouts(
    url: &str,
    max_connections: u32,
    timeouts: DatabaseTimeouts,
) -> Result<PgPool, SqlxError> {
    debug!(
        max_connections,
        statement_timeout_ms = timeouts.statement_timeout.as_millis() as u64,
        "creating postgres pool"
    );
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeouts.acquire_timeout)
        .test_before_acquire(true)
        .idle_timeout(timeouts.idle_timeout)
        .max_lifetime(timeouts.max_lifetime)
        // Session-level timeouts apply to every statement on the connection.
        // SET does not accept bind parameters, hence the format.
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                let stmt_ms = timeouts.statement_timeout.as_millis();
                let lock_ms = timeouts.lock_timeout.as_millis();
                sqlx::query(&format!("SET statement_timeout = '{stmt_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("SET lock_timeout = '{lock_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

/// Whether a sqlx error is worth retrying.
///
/// Prefers SQLSTATE classification; falls back to message heuristics for
/// errors that do not surface a code.
pub fn is_transient_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Io(_)
        | SqlxError::PoolTimedOut
        | SqlxError::PoolClosed
        | SqlxError::Tls(_) => true,

        SqlxError::Database(db_error) => {
            if let Some(code) = db_error.code() {
                let code = code.as_ref();
                // 08***  connection exception
                // 53***  insufficient resources
                // 57***  operator intervention (statement_timeout lands here)
                // 58***  system error
                // 40001  serialization failure
                // 40P01  deadlock detected
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40P01"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("deadlock")
                    || msg.contains("terminating connection due to")
            }
        }

        SqlxError::Protocol(msg) => {
            let m = msg.to_lowercase();
            m.contains("connection") || m.contains("timeout")
        }

        _ => false,
    }
}
