//! PostgreSQL connection plumbing.
//!
//! Each worker owns at most one source and one target connection for its
//! lifetime; this module hands them out and carries the snapshot dance
//! that makes parallel COPY consistent: the coordinator exports a
//! REPEATABLE READ snapshot, and every worker connection imports it with
//! `SET TRANSACTION SNAPSHOT` before reading.

use std::ops::Deref;

use tokio_postgres::{Client, NoTls};
use tracing::debug;

use crate::error::{Result, ShuttleError};
use crate::lsn::Lsn;

/// A client plus its spawned connection driver. Dropping the client closes
/// the socket and lets the driver task finish.
pub struct PgConn {
    client: Client,
    _driver: tokio::task::JoinHandle<()>,
}

impl PgConn {
    /// Connect with a libpq-style URI or keyword string.
    pub async fn connect(uri: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(uri, NoTls)
            .await
            .map_err(|e| ShuttleError::Connection(e.to_string()))?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "connection driver ended");
            }
        });
        Ok(Self {
            client,
            _driver: driver,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

impl Deref for PgConn {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

// ── Connection pool ────────────────────────────────────────────────────────

/// A small check-out/check-in pool for short statements (index builds,
/// constraint promotion, vacuum). Checked-in connections are reused;
/// a checkout with an empty pool dials a new connection.
pub struct PgPool {
    uri: String,
    idle: std::sync::Mutex<Vec<PgConn>>,
}

impl PgPool {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            idle: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn get(&self) -> Result<PgConn> {
        if let Ok(mut idle) = self.idle.lock() {
            if let Some(conn) = idle.pop() {
                if !conn.is_closed() {
                    return Ok(conn);
                }
            }
        }
        PgConn::connect(&self.uri).await
    }

    /// Return a healthy connection for reuse. Broken connections are
    /// dropped on the floor.
    pub fn put(&self, conn: PgConn) {
        if conn.is_closed() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

// ── Snapshot management ────────────────────────────────────────────────────

/// Open a REPEATABLE READ read-only transaction and export its snapshot.
/// The transaction stays open for as long as the connection lives; every
/// importing worker sees the same point in time.
pub async fn export_snapshot(client: &Client) -> Result<String> {
    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    let row = client.query_one("SELECT pg_export_snapshot()", &[]).await?;
    Ok(row.get::<_, String>(0))
}

/// Import a previously exported snapshot on a fresh connection.
pub async fn import_snapshot(client: &Client, snapshot: &str) -> Result<()> {
    client
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    client
        .execute(
            &format!("SET TRANSACTION SNAPSHOT {}", quote_literal(snapshot)),
            &[],
        )
        .await?;
    Ok(())
}

// ── Server identity ────────────────────────────────────────────────────────

/// `pg_control_system()` identity, used to detect that a resumed run still
/// points at the same source cluster.
pub async fn system_identifier(client: &Client) -> Result<String> {
    let row = client
        .query_one(
            "SELECT system_identifier::text FROM pg_control_system()",
            &[],
        )
        .await?;
    Ok(row.get::<_, String>(0))
}

/// Current timeline from the control file checkpoint.
pub async fn timeline_id(client: &Client) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT timeline_id::bigint FROM pg_control_checkpoint()",
            &[],
        )
        .await?;
    Ok(row.get::<_, i64>(0))
}

/// Current WAL insert position on the source.
pub async fn current_wal_lsn(client: &Client) -> Result<Lsn> {
    let row = client
        .query_one("SELECT pg_current_wal_lsn()::text", &[])
        .await?;
    row.get::<_, String>(0).parse()
}

/// `server_version_num`, e.g. 160002.
pub async fn server_version_num(client: &Client) -> Result<i32> {
    let row = client
        .query_one("SELECT current_setting('server_version_num')::int", &[])
        .await?;
    Ok(row.get::<_, i32>(0))
}

// ── Quoting ────────────────────────────────────────────────────────────────

/// Double-quote an SQL identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `schema.name` with both halves quoted.
pub fn quote_qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Single-quote an SQL literal. With `standard_conforming_strings` (the
/// server default since 9.1) doubling embedded quotes is sufficient.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(quote_ident("MixedCase"), "\"MixedCase\"");
    }

    #[test]
    fn test_quote_qualified() {
        assert_eq!(quote_qualified("public", "users"), "\"public\".\"users\"");
        assert_eq!(
            quote_qualified("odd.schema", "t"),
            "\"odd.schema\".\"t\""
        );
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(quote_literal(""), "''");
        // backslashes pass through untouched under standard_conforming_strings
        assert_eq!(quote_literal(r"a\b"), r"'a\b'");
    }
}
