//! Scripted in-memory transport for pool and engine tests.
//!
//! Dispatches on the small set of statement shapes the engine generates
//! (reads, existence probes, length lookups, inserts, marker updates) so
//! tests can script tables and failures without a server.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::error::{Result, TransferError};
use crate::transport::{QueryResult, Transport};
use crate::value::SqlValue;

pub(crate) type MockRow = HashMap<String, SqlValue>;

#[derive(Default)]
pub(crate) struct MockDb {
    /// Source-side rows by table name.
    pub source_rows: HashMap<String, Vec<MockRow>>,
    /// Target-side rows by table name, as inserted by the engine.
    pub target_rows: HashMap<String, Vec<MockRow>>,
    /// Declared max character lengths by (table, column).
    pub column_lengths: HashMap<(String, String), i32>,
    /// Columns the server pretends not to have (error 207 on reference).
    pub missing_columns: HashSet<String>,
    /// Scalar results returned for pre-executed function queries, in order.
    pub scalar_results: VecDeque<SqlValue>,
    /// Server error numbers injected into upcoming execute() calls.
    pub fail_next_execute: VecDeque<u32>,
    /// Remaining connect attempts that must fail.
    pub connect_failures: u32,
    /// Remaining probe queries ("SELECT 1") that must fail.
    pub probe_failures: u32,
    /// Connection ids the transport reports as disconnected.
    pub disconnected: HashSet<u64>,
    /// Marker updates recorded as (table, field, value, document id).
    pub markers: Vec<(String, String, SqlValue, SqlValue)>,
    pub connections_opened: u64,
    pub connections_closed: u64,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    pub db: Arc<Mutex<MockDb>>,
    next_id: Arc<AtomicU64>,
}

pub(crate) struct MockConn {
    pub id: u64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_db(db: MockDb) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn referenced_missing_column(&self, sql: &str) -> Option<String> {
        let db = self.db.lock().unwrap();
        db.missing_columns
            .iter()
            .find(|c| sql.contains(&format!("[{c}]")) || sql.contains(c.as_str()))
            .cloned()
    }
}

/// Extract the first bracketed identifier after `marker`.
fn ident_after(sql: &str, marker: &str) -> Option<String> {
    let idx = sql.find(marker)? + marker.len();
    let rest = &sql[idx..];
    let start = rest.find('[')? + 1;
    let end = rest[start..].find(']')? + start;
    Some(rest[start..end].to_string())
}

/// Parse `[a], [b], ...` column lists.
fn bracket_list(segment: &str) -> Vec<String> {
    let mut cols = Vec::new();
    let mut rest = segment;
    while let Some(start) = rest.find('[') {
        if let Some(end) = rest[start + 1..].find(']') {
            cols.push(rest[start + 1..start + 1 + end].to_string());
            rest = &rest[start + 1 + end..];
        } else {
            break;
        }
    }
    cols
}

/// Split a VALUES segment on top-level commas (inline expressions may
/// contain nested parentheses).
fn split_values(segment: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in segment.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

#[async_trait]
impl Transport for MockTransport {
    type Conn = MockConn;

    async fn connect(&self, _config: &ServerConfig) -> Result<Self::Conn> {
        let mut db = self.db.lock().unwrap();
        if db.connect_failures > 0 {
            db.connect_failures -= 1;
            return Err(TransferError::ConnectionLost("mock connect refused".into()));
        }
        db.connections_opened += 1;
        Ok(MockConn {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn query(
        &self,
        conn: &mut Self::Conn,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult> {
        {
            let db = self.db.lock().unwrap();
            if db.disconnected.contains(&conn.id) {
                return Err(TransferError::ConnectionLost("mock connection dropped".into()));
            }
        }

        if sql.trim() == "SELECT 1" {
            let mut db = self.db.lock().unwrap();
            if db.probe_failures > 0 {
                db.probe_failures -= 1;
                return Err(TransferError::ConnectionLost("mock probe failed".into()));
            }
            return Ok(QueryResult {
                columns: vec!["".into()],
                rows: vec![vec![SqlValue::I32(1)]],
                rows_affected: 0,
            });
        }

        if sql.contains("INFORMATION_SCHEMA.COLUMNS") {
            let table = params[0].to_text();
            let column = params[1].to_text();
            let db = self.db.lock().unwrap();
            let rows = db
                .column_lengths
                .get(&(table, column))
                .map(|len| vec![vec![SqlValue::I32(*len)]])
                .unwrap_or_default();
            return Ok(QueryResult {
                columns: vec!["CHARACTER_MAXIMUM_LENGTH".into()],
                rows,
                rows_affected: 0,
            });
        }

        if let Some(col) = self.referenced_missing_column(sql) {
            return Err(TransferError::classify_server_error(
                207,
                &format!("Invalid column name '{col}'."),
            ));
        }

        // Existence probe: SELECT TOP 1 1 FROM [T] WHERE [pk] = @P1 [AND [d] = @P2]
        if sql.starts_with("SELECT TOP 1 1") {
            let table = ident_after(sql, "FROM ").expect("probe table");
            let where_part = &sql[sql.find("WHERE").expect("probe where")..];
            let conditions = bracket_list(where_part);
            let db = self.db.lock().unwrap();
            let found = db.target_rows.get(&table).is_some_and(|rows| {
                rows.iter().any(|row| {
                    conditions
                        .iter()
                        .zip(params)
                        .all(|(col, val)| row.get(col).map(|v| v.to_text()) == Some(val.to_text()))
                })
            });
            let rows = if found {
                vec![vec![SqlValue::I32(1)]]
            } else {
                vec![]
            };
            return Ok(QueryResult {
                columns: vec!["".into()],
                rows,
                rows_affected: 0,
            });
        }

        // Pre-executed scalar function: SELECT <expr> AS result
        if sql.contains(" AS result") {
            let mut db = self.db.lock().unwrap();
            let value = db.scalar_results.pop_front().unwrap_or(SqlValue::Null);
            return Ok(QueryResult {
                columns: vec!["result".into()],
                rows: vec![vec![value]],
                rows_affected: 0,
            });
        }

        // Row read: SELECT * FROM [T] WHERE [key] = @P1 [...]
        if sql.starts_with("SELECT * FROM") {
            let table = ident_after(sql, "FROM ").expect("read table");
            let key = ident_after(sql, "WHERE ").expect("read key");
            let wanted = params[0].to_text();
            let db = self.db.lock().unwrap();
            let matched: Vec<&MockRow> = db
                .source_rows
                .get(&table)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| r.get(&key).map(|v| v.to_text()) == Some(wanted.clone()))
                        .collect()
                })
                .unwrap_or_default();

            let mut columns: Vec<String> = Vec::new();
            for row in &matched {
                for col in row.keys() {
                    if !columns.iter().any(|c| c == col) {
                        columns.push(col.clone());
                    }
                }
            }
            let rows = matched
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or(SqlValue::Null))
                        .collect()
                })
                .collect();
            return Ok(QueryResult {
                columns,
                rows,
                rows_affected: 0,
            });
        }

        panic!("MockTransport: unrecognized query: {sql}");
    }

    async fn execute(&self, conn: &mut Self::Conn, sql: &str, params: &[SqlValue]) -> Result<u64> {
        {
            let mut db = self.db.lock().unwrap();
            if db.disconnected.contains(&conn.id) {
                return Err(TransferError::ConnectionLost("mock connection dropped".into()));
            }
            if let Some(code) = db.fail_next_execute.pop_front() {
                return Err(match code {
                    0 => TransferError::ConnectionLost("mock connection dropped".into()),
                    n => TransferError::classify_server_error(n, &format!("mock server error {n}")),
                });
            }
        }

        if sql.starts_with("INSERT INTO") {
            let table = ident_after(sql, "INTO ").expect("insert table");
            let cols_start = sql.find('(').expect("insert cols");
            let cols_end = sql.find(") VALUES").expect("insert cols end");
            let columns = bracket_list(&sql[cols_start..cols_end + 1]);
            let values_start = sql.find("VALUES (").expect("values") + "VALUES (".len();
            let values = split_values(&sql[values_start..sql.len() - 1]);

            let mut row = MockRow::new();
            for (col, expr) in columns.iter().zip(values.iter()) {
                let value = if let Some(n) = expr.strip_prefix("@P") {
                    let idx: usize = n.parse().expect("param index");
                    params[idx - 1].clone()
                } else {
                    // Inline expression text is stored verbatim for assertions.
                    SqlValue::Text(expr.clone())
                };
                row.insert(col.clone(), value);
            }

            let mut db = self.db.lock().unwrap();
            db.target_rows.entry(table).or_default().push(row);
            return Ok(1);
        }

        if sql.starts_with("UPDATE") {
            let table = ident_after(sql, "UPDATE ").expect("update table");
            let field = ident_after(sql, "SET ").expect("update field");
            let key = ident_after(sql, "WHERE ").expect("update key");
            let mut db = self.db.lock().unwrap();
            db.markers
                .push((table.clone(), field.clone(), params[0].clone(), params[1].clone()));
            if let Some(rows) = db.source_rows.get_mut(&table) {
                for row in rows.iter_mut() {
                    if row.get(&key).map(|v| v.to_text()) == Some(params[1].to_text()) {
                        row.insert(field.clone(), params[0].clone());
                    }
                }
            }
            return Ok(1);
        }

        panic!("MockTransport: unrecognized statement: {sql}");
    }

    async fn close(&self, conn: Self::Conn) {
        let mut db = self.db.lock().unwrap();
        db.connections_closed += 1;
        db.disconnected.remove(&conn.id);
    }

    fn is_connected(&self, conn: &Self::Conn) -> bool {
        !self.db.lock().unwrap().disconnected.contains(&conn.id)
    }
}
