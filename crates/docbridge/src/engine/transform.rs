//! Per-row field transformation: SQL-function templates, defaults,
//! translations, consecutive substitution, and length clamping.
//!
//! Identifiers and values never mix: identifiers are validated and quoted
//! through [`crate::ident`], values either bind as parameters or render
//! through the single type-aware literal writer on [`SqlValue`].

use std::collections::HashMap;

use tracing::debug;

use crate::config::{
    validate_function_template, ConsecutiveConfig, FieldMapping, FunctionServer, TableConfig,
};
use crate::error::{Result, TransferError};
use crate::ident::{qualify_table, quote_ident};
use crate::pool::PooledConnection;
use crate::sequence::Consecutive;
use crate::transport::Transport;
use crate::value::SqlValue;

/// A row keyed by column name, as read from the source.
pub(crate) type Row = HashMap<String, SqlValue>;

/// A resolved target-field value: bound as a parameter, or an expression
/// embedded into the statement text.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    Bound(SqlValue),
    Inline(String),
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Placeholder(String),
}

/// Parsed SQL-function template with `@{field}` placeholders.
#[derive(Debug)]
pub(crate) struct SqlTemplate {
    segments: Vec<Segment>,
}

impl SqlTemplate {
    /// Parse and validate a template. Unbalanced parentheses or statement
    /// separators are hard errors.
    pub fn parse(template: &str) -> Result<Self> {
        validate_function_template(template)?;

        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(start) = rest.find("@{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| TransferError::SqlSyntax {
                message: format!("Unterminated placeholder in SQL function: {template:?}"),
                token: None,
            })?;
            segments.push(Segment::Placeholder(after[..end].to_string()));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Expand placeholders as literal, type-aware SQL text for inline use.
    pub fn expand_inline(&self, row: &Row) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Placeholder(name) => {
                    let value = row.get(name.as_str()).cloned().unwrap_or(SqlValue::Null);
                    out.push_str(&value.to_literal());
                }
            }
        }
        out
    }

    /// Expand placeholders as bound parameters, returning the expression
    /// text with `@Pn` markers and the parameter values in order.
    pub fn expand_bound(&self, row: &Row) -> (String, Vec<SqlValue>) {
        let mut out = String::new();
        let mut params = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Placeholder(name) => {
                    params.push(row.get(name.as_str()).cloned().unwrap_or(SqlValue::Null));
                    out.push_str(&format!("@P{}", params.len()));
                }
            }
        }
        (out, params)
    }
}

/// Per-run cache of target column max character lengths.
///
/// Lives for the duration of one `process_documents` call only; never
/// shared across runs.
#[derive(Default)]
pub(crate) struct ColumnLengths {
    cache: HashMap<(String, String), Option<i32>>,
}

impl ColumnLengths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declared max character length of a target column, or None when the
    /// column is unknown or unbounded (varchar(max) reports -1).
    pub async fn max_length<T: Transport>(
        &mut self,
        target: &mut PooledConnection<T>,
        table: &str,
        column: &str,
    ) -> Result<Option<i32>> {
        let bare_table = table.rsplit('.').next().unwrap_or(table).to_string();
        let key = (bare_table.clone(), column.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return Ok(*cached);
        }

        let result = target
            .query(
                "SELECT CHARACTER_MAXIMUM_LENGTH FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME = @P1 AND COLUMN_NAME = @P2",
                &[
                    SqlValue::Text(bare_table),
                    SqlValue::Text(column.to_string()),
                ],
            )
            .await?;

        let length = match result.scalar() {
            Some(SqlValue::I32(n)) if *n > 0 => Some(*n),
            _ => None,
        };
        self.cache.insert(key, length);
        Ok(length)
    }
}

/// Transform one source row into target field values, in mapping order.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn transform_row<T: Transport>(
    table: &TableConfig,
    row: &Row,
    consecutive: Option<&Consecutive>,
    consecutive_config: Option<&ConsecutiveConfig>,
    source: &mut PooledConnection<T>,
    target: &mut PooledConnection<T>,
    lengths: &mut ColumnLengths,
) -> Result<Vec<(String, FieldValue)>> {
    let mut fields = Vec::with_capacity(table.field_mappings.len());

    for mapping in &table.field_mappings {
        let mut value = resolve_field(mapping, row, source, target).await?;

        // Consecutive substitution overrides the designated table+field.
        if let (Some(consecutive), Some(config)) = (consecutive, consecutive_config) {
            if config.target_table == table.target_table
                && config.target_field == mapping.target_field
            {
                value = FieldValue::Bound(SqlValue::Text(consecutive.formatted.clone()));
            }
        }

        if mapping.required {
            if let FieldValue::Bound(SqlValue::Null) = value {
                return Err(TransferError::NullConstraint(format!(
                    "required field '{}' has no value",
                    mapping.target_field
                )));
            }
        }

        if let FieldValue::Bound(bound) = &value {
            if !mapping.value_mappings.is_empty() && !bound.is_null() {
                let text = bound.to_text();
                if let Some(translated) = mapping
                    .value_mappings
                    .iter()
                    .find(|vm| vm.from == text)
                {
                    value = FieldValue::Bound(SqlValue::Text(translated.to.clone()));
                }
            }
        }

        // Length clamp: silently truncate overlong strings, never error.
        if let FieldValue::Bound(SqlValue::Text(text)) = &value {
            if let Some(max) = lengths
                .max_length(target, &table.target_table, &mapping.target_field)
                .await?
            {
                let max = max as usize;
                if text.chars().count() > max {
                    debug!(
                        field = %mapping.target_field,
                        max,
                        "clamping overlong value"
                    );
                    let clamped: String = text.chars().take(max).collect();
                    value = FieldValue::Bound(SqlValue::Text(clamped));
                }
            }
        }

        fields.push((mapping.target_field.clone(), value));
    }

    Ok(fields)
}

/// Resolve a field's raw value: SQL function, source column, or default.
async fn resolve_field<T: Transport>(
    mapping: &FieldMapping,
    row: &Row,
    source: &mut PooledConnection<T>,
    target: &mut PooledConnection<T>,
) -> Result<FieldValue> {
    if let Some(template) = &mapping.sql_function {
        let template = SqlTemplate::parse(template)?;
        if mapping.pre_execute {
            let (expr, params) = template.expand_bound(row);
            let sql = format!("SELECT {expr} AS result");
            let result = match mapping.function_server {
                FunctionServer::Source => source.query(&sql, &params).await?,
                FunctionServer::Target => target.query(&sql, &params).await?,
            };
            let scalar = result.scalar().cloned().unwrap_or(SqlValue::Null);
            return Ok(FieldValue::Bound(scalar));
        }
        return Ok(FieldValue::Inline(template.expand_inline(row)));
    }

    let source_value = mapping
        .source_field
        .as_deref()
        .and_then(|f| row.get(f))
        .cloned()
        .filter(|v| !v.is_null());

    if let Some(mut value) = source_value {
        let stripped = match (&mapping.strip_prefix, &value) {
            (Some(prefix), SqlValue::Text(text)) => {
                text.strip_prefix(prefix.as_str()).map(|s| s.to_string())
            }
            _ => None,
        };
        if let Some(text) = stripped {
            value = SqlValue::Text(text);
        }
        return Ok(FieldValue::Bound(value));
    }

    match mapping.default_value.as_deref() {
        // The literal string "NULL" means a real SQL NULL.
        Some("NULL") => Ok(FieldValue::Bound(SqlValue::Null)),
        Some(default) => Ok(FieldValue::Bound(SqlValue::Text(default.to_string()))),
        None => Ok(FieldValue::Bound(SqlValue::Null)),
    }
}

/// Assemble an INSERT for the transformed fields. Bound values become
/// positional parameters; inline expressions embed verbatim.
pub(crate) fn build_insert(
    target_table: &str,
    fields: &[(String, FieldValue)],
) -> Result<(String, Vec<SqlValue>)> {
    let mut columns = Vec::with_capacity(fields.len());
    let mut placeholders = Vec::with_capacity(fields.len());
    let mut params = Vec::new();

    for (column, value) in fields {
        columns.push(quote_ident(column)?);
        match value {
            FieldValue::Bound(v) => {
                params.push(v.clone());
                placeholders.push(format!("@P{}", params.len()));
            }
            FieldValue::Inline(expr) => placeholders.push(expr.clone()),
        }
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualify_table(target_table)?,
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, SqlValue)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_template_inline_expansion_is_type_aware() {
        let template = SqlTemplate::parse("ISNULL(@{Code}, @{Qty})").unwrap();
        let row = row(&[
            ("Code", SqlValue::Text("A'B".into())),
            ("Qty", SqlValue::I32(3)),
        ]);
        assert_eq!(template.expand_inline(&row), "ISNULL('A''B', 3)");
    }

    #[test]
    fn test_template_inline_missing_field_is_null() {
        let template = SqlTemplate::parse("UPPER(@{Missing})").unwrap();
        assert_eq!(template.expand_inline(&row(&[])), "UPPER(NULL)");
    }

    #[test]
    fn test_template_bound_expansion_numbers_params() {
        let template = SqlTemplate::parse("@{A} + @{B}").unwrap();
        let row = row(&[("A", SqlValue::I32(1)), ("B", SqlValue::I32(2))]);
        let (expr, params) = template.expand_bound(&row);
        assert_eq!(expr, "@P1 + @P2");
        assert_eq!(params, vec![SqlValue::I32(1), SqlValue::I32(2)]);
    }

    #[test]
    fn test_template_rejects_unbalanced_parens() {
        let err = SqlTemplate::parse("ISNULL(@{A}, 'x'").unwrap_err();
        assert_eq!(err.error_code(), "SQL_SYNTAX");
    }

    #[test]
    fn test_template_rejects_unterminated_placeholder() {
        assert!(SqlTemplate::parse("UPPER(@{Name)").is_err());
    }

    #[test]
    fn test_build_insert_mixes_bound_and_inline() {
        let fields = vec![
            ("Id".to_string(), FieldValue::Bound(SqlValue::I32(7))),
            ("Stamp".to_string(), FieldValue::Inline("GETDATE()".into())),
            (
                "Name".to_string(),
                FieldValue::Bound(SqlValue::Text("x".into())),
            ),
        ];
        let (sql, params) = build_insert("dbo.PED", &fields).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO [dbo].[PED] ([Id], [Stamp], [Name]) VALUES (@P1, GETDATE(), @P2)"
        );
        assert_eq!(params, vec![SqlValue::I32(7), SqlValue::Text("x".into())]);
    }

    #[test]
    fn test_build_insert_rejects_bad_identifier() {
        let fields = vec![("".to_string(), FieldValue::Bound(SqlValue::Null))];
        assert!(build_insert("PED", &fields).is_err());
    }
}
