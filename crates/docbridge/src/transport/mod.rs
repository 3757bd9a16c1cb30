//! Wire-protocol seam between the engine/pool and the remote servers.
//!
//! The core's contract with the transport layer is deliberately small:
//! connect, query/execute with bound parameters, close, plus a trivial
//! health probe. The production implementation speaks TDS ([`TdsTransport`]);
//! tests script an in-memory implementation against the same trait.

mod tds;

#[cfg(test)]
pub(crate) mod mock;

pub use tds::TdsTransport;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::value::SqlValue;
use async_trait::async_trait;

/// Result of one statement: column names, rows, and the affected-row count
/// (zero for reads, row count for writes).
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column names in select order.
    pub columns: Vec<String>,

    /// Row data, one `SqlValue` per column.
    pub rows: Vec<Vec<SqlValue>>,

    /// Rows affected by a write statement.
    pub rows_affected: u64,
}

impl QueryResult {
    /// Look up a value by row index and column name (case-insensitive,
    /// matching the server's identifier semantics).
    pub fn value(&self, row: usize, column: &str) -> Option<&SqlValue> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))?;
        self.rows.get(row)?.get(idx)
    }

    /// First column of the first row, for scalar queries.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first()?.first()
    }

    /// Whether the result carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Transport for a connection-oriented tabular wire protocol.
///
/// Implementations own how a connection is established and how statements
/// travel; everything above this trait is protocol-agnostic.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// An open, authenticated session.
    type Conn: Send;

    /// Establish a new connection.
    async fn connect(&self, config: &ServerConfig) -> Result<Self::Conn>;

    /// Run a row-returning statement with positionally bound parameters.
    async fn query(
        &self,
        conn: &mut Self::Conn,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult>;

    /// Run a write statement; returns the affected-row count.
    async fn execute(&self, conn: &mut Self::Conn, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Close the connection. Best-effort; errors are the implementation's
    /// to log.
    async fn close(&self, conn: Self::Conn);

    /// Whether the transport currently reports the connection as live.
    /// Protocols that only detect breakage on use return true here and
    /// surface failures from `query`/`execute`.
    fn is_connected(&self, _conn: &Self::Conn) -> bool {
        true
    }

    /// Trivial-query health probe used by pool validation and robust
    /// connect.
    async fn probe(&self, conn: &mut Self::Conn) -> bool {
        self.query(conn, "SELECT 1", &[]).await.is_ok()
    }
}
