//! Per-document read-transform-write pipeline.
//!
//! Header and detail rows travel as independent statements, deliberately
//! without a multi-statement transaction, so a mid-document failure can leave a
//! document partially written. The target existence check guards header
//! re-insertion on retry; the optional detail dedup probe guards detail
//! re-insertion.

use tracing::{debug, warn};

use crate::config::{MappingConfig, TableConfig};
use crate::engine::transform::{build_insert, transform_row, ColumnLengths, Row};
use crate::error::{Result, TransferError};
use crate::ident::{qualify_table, quote_ident};
use crate::pool::PooledConnection;
use crate::sequence::Consecutive;
use crate::transport::{QueryResult, Transport};
use crate::value::SqlValue;

/// What one document's pipeline produced.
pub(crate) struct PipelineOutcome {
    /// Resolved document type ("unknown" when no rule matched).
    pub document_type: String,

    /// Target tables written, in order.
    pub processed_tables: Vec<String>,

    /// Source table and key column of the first matched header, for the
    /// processed-marker writeback.
    pub marker_table: Option<(String, String)>,
}

/// Run the pipeline for one document.
pub(crate) async fn process_document<T: Transport>(
    mapping: &MappingConfig,
    document_id: &str,
    consecutive: Option<&Consecutive>,
    source: &mut PooledConnection<T>,
    target: &mut PooledConnection<T>,
    lengths: &mut ColumnLengths,
) -> Result<PipelineOutcome> {
    let consecutive_config = mapping.consecutive.as_ref().filter(|c| c.enabled);
    let mut outcome = PipelineOutcome {
        document_type: "unknown".to_string(),
        processed_tables: Vec::new(),
        marker_table: None,
    };
    let mut matched_any = false;

    for header in mapping.header_tables() {
        // A missing row is not fatal: a document lives in exactly one of
        // the candidate header tables.
        let result = read_rows(header, document_id, source).await?;
        if result.is_empty() {
            continue;
        }
        let row = row_map(&result, 0);

        if !matched_any {
            matched_any = true;
            outcome.document_type = classify(mapping, &row);
            outcome.marker_table =
                Some((header.source_table.clone(), header.primary_key.clone()));
        }

        // Existence check: the primary idempotency guard for re-runs.
        // ColumnNotFound here is fatal: this probe is mandatory.
        if target_exists(header, document_id, target).await? {
            return Err(TransferError::DuplicateKey(format!(
                "document '{document_id}' already exists in '{}'",
                header.target_table
            )));
        }

        let fields = transform_row(
            header,
            &row,
            consecutive,
            consecutive_config,
            source,
            target,
            lengths,
        )
        .await?;
        let (sql, params) = build_insert(&header.target_table, &fields)?;
        target.execute(&sql, &params).await?;
        outcome.processed_tables.push(header.target_table.clone());
        debug!(document_id, table = %header.target_table, "header row inserted");

        for detail in mapping.detail_tables_of(&header.source_table) {
            let result = read_rows(detail, document_id, source).await?;
            let mut inserted = 0usize;

            for idx in 0..result.rows.len() {
                let detail_row = row_map(&result, idx);

                if let Some(dedup_field) = &detail.detail_dedup_field {
                    if detail_exists(detail, document_id, dedup_field, &detail_row, target).await? {
                        debug!(
                            document_id,
                            table = %detail.target_table,
                            "detail row already present; skipping"
                        );
                        continue;
                    }
                }

                let fields = transform_row(
                    detail,
                    &detail_row,
                    consecutive,
                    consecutive_config,
                    source,
                    target,
                    lengths,
                )
                .await?;
                let (sql, params) = build_insert(&detail.target_table, &fields)?;
                target.execute(&sql, &params).await?;
                inserted += 1;
            }

            if inserted > 0 {
                outcome.processed_tables.push(detail.target_table.clone());
                debug!(
                    document_id,
                    table = %detail.target_table,
                    rows = inserted,
                    "detail rows inserted"
                );
            }
        }
    }

    if !matched_any {
        return Err(TransferError::TableNotFound(format!(
            "no header row found for document '{document_id}'"
        )));
    }
    Ok(outcome)
}

/// Read the rows of a table config for a document: custom query, or a
/// generated select. A `ColumnNotFound` against the optional order/filter
/// degrades by dropping that clause; anything else propagates.
async fn read_rows<T: Transport>(
    table: &TableConfig,
    document_id: &str,
    source: &mut PooledConnection<T>,
) -> Result<QueryResult> {
    let params = [SqlValue::Text(document_id.to_string())];

    if let Some(custom) = &table.custom_query {
        let sql = custom.replace("@{id}", "@P1");
        return source.query(&sql, &params).await;
    }

    let mut filter = table.filter_condition.as_deref();
    let mut order = table.order_by.as_deref();

    loop {
        let sql = build_select(table, filter, order)?;
        match source.query(&sql, &params).await {
            Ok(result) => return Ok(result),
            Err(TransferError::ColumnNotFound(col)) if order.is_some() => {
                warn!(
                    table = %table.source_table,
                    column = %col,
                    "order column missing; reading unordered"
                );
                order = None;
            }
            Err(TransferError::ColumnNotFound(col)) if filter.is_some() => {
                warn!(
                    table = %table.source_table,
                    column = %col,
                    "filter column missing; reading unfiltered"
                );
                filter = None;
            }
            Err(e) => return Err(e),
        }
    }
}

fn build_select(table: &TableConfig, filter: Option<&str>, order: Option<&str>) -> Result<String> {
    let mut sql = format!(
        "SELECT * FROM {} WHERE {} = @P1",
        qualify_table(&table.source_table)?,
        quote_ident(&table.primary_key)?
    );
    if let Some(filter) = filter {
        sql.push_str(&format!(" AND ({filter})"));
    }
    if let Some(order) = order {
        sql.push_str(&format!(" ORDER BY {}", quote_ident(order)?));
    }
    Ok(sql)
}

/// Classify a document via the ordered rules; first match wins.
fn classify(mapping: &MappingConfig, row: &Row) -> String {
    for rule in &mapping.document_type_rules {
        if let Some(value) = row.get(&rule.source_field) {
            let text = value.to_text();
            if rule.source_values.iter().any(|v| v == &text) {
                return rule.name.clone();
            }
        }
    }
    "unknown".to_string()
}

async fn target_exists<T: Transport>(
    table: &TableConfig,
    document_id: &str,
    target: &mut PooledConnection<T>,
) -> Result<bool> {
    let sql = format!(
        "SELECT TOP 1 1 FROM {} WHERE {} = @P1",
        qualify_table(&table.target_table)?,
        quote_ident(table.target_pk())?
    );
    let result = target
        .query(&sql, &[SqlValue::Text(document_id.to_string())])
        .await?;
    Ok(!result.is_empty())
}

async fn detail_exists<T: Transport>(
    table: &TableConfig,
    document_id: &str,
    dedup_field: &str,
    row: &Row,
    target: &mut PooledConnection<T>,
) -> Result<bool> {
    let dedup_value = row.get(dedup_field).cloned().unwrap_or(SqlValue::Null);
    let sql = format!(
        "SELECT TOP 1 1 FROM {} WHERE {} = @P1 AND {} = @P2",
        qualify_table(&table.target_table)?,
        quote_ident(table.target_pk())?,
        quote_ident(dedup_field)?
    );
    let result = target
        .query(
            &sql,
            &[SqlValue::Text(document_id.to_string()), dedup_value],
        )
        .await?;
    Ok(!result.is_empty())
}

/// Materialize one result row as a name→value map.
fn row_map(result: &QueryResult, idx: usize) -> Row {
    result
        .columns
        .iter()
        .cloned()
        .zip(result.rows[idx].iter().cloned())
        .collect()
}
