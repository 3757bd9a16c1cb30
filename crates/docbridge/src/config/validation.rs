//! Structural validation of mapping configurations.
//!
//! Mappings are edited by hand in an external UI; everything here runs
//! before a transfer starts so malformed mappings fail the run up front
//! instead of midway through a document.

use super::types::MappingConfig;
use crate::error::{Result, TransferError};

/// Validate a mapping configuration before running a transfer against it.
pub fn validate_mapping(mapping: &MappingConfig) -> Result<()> {
    if mapping.tables.is_empty() {
        return Err(TransferError::Config(format!(
            "Mapping '{}' declares no tables",
            mapping.id
        )));
    }

    let header_count = mapping.tables.iter().filter(|t| !t.is_detail).count();
    if header_count == 0 {
        return Err(TransferError::Config(format!(
            "Mapping '{}' has no header table",
            mapping.id
        )));
    }

    for table in &mapping.tables {
        if table.is_detail {
            let parent = table.parent_ref.as_deref().ok_or_else(|| {
                TransferError::Config(format!(
                    "Detail table '{}' has no parent_ref",
                    table.source_table
                ))
            })?;

            let resolves = mapping
                .tables
                .iter()
                .any(|t| !t.is_detail && t.source_table == parent);
            if !resolves {
                return Err(TransferError::Config(format!(
                    "Detail table '{}' references unknown parent '{parent}'",
                    table.source_table
                )));
            }
        }

        let consecutive_target = mapping.consecutive.as_ref().filter(|c| c.enabled);

        for fm in &table.field_mappings {
            if fm.target_field.is_empty() {
                return Err(TransferError::Config(format!(
                    "Table '{}' has a field mapping with an empty target field",
                    table.source_table
                )));
            }

            let is_consecutive_target = consecutive_target.is_some_and(|c| {
                c.target_table == table.target_table && c.target_field == fm.target_field
            });

            let has_source = fm.source_field.is_some()
                || fm.default_value.is_some()
                || fm.sql_function.is_some();
            if !has_source && !is_consecutive_target {
                return Err(TransferError::Config(format!(
                    "Field '{}' on table '{}' has no value source",
                    fm.target_field, table.source_table
                )));
            }

            if let Some(template) = &fm.sql_function {
                validate_function_template(template)?;
            }
        }
    }

    if let Some(consecutive) = mapping.consecutive.as_ref().filter(|c| c.enabled) {
        if consecutive.centralized && consecutive.allocator_id.is_none() {
            return Err(TransferError::Config(format!(
                "Mapping '{}' uses centralized consecutives but names no allocator id",
                mapping.id
            )));
        }
    }

    Ok(())
}

/// Validate a SQL-function template: balanced parentheses and no statement
/// separators or comment markers. Unbalanced parentheses are a hard error
/// for the whole document, so they are rejected here as well, before any
/// document runs.
pub fn validate_function_template(template: &str) -> Result<()> {
    if template.contains(';') {
        return Err(TransferError::Config(format!(
            "SQL function contains statement separator: {template:?}"
        )));
    }

    if template.contains("--") || template.contains("/*") || template.contains("*/") {
        return Err(TransferError::Config(format!(
            "SQL function contains comment markers: {template:?}"
        )));
    }

    let mut depth: i32 = 0;
    for c in template.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(TransferError::SqlSyntax {
            message: format!("Unbalanced parentheses in SQL function: {template:?}"),
            token: None,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{FieldMapping, TableConfig};

    fn plain_field(target: &str, source: &str) -> FieldMapping {
        FieldMapping {
            target_field: target.into(),
            source_field: Some(source.into()),
            default_value: None,
            sql_function: None,
            pre_execute: false,
            function_server: Default::default(),
            value_mappings: vec![],
            strip_prefix: None,
            required: false,
        }
    }

    fn header_table() -> TableConfig {
        TableConfig {
            source_table: "Orders".into(),
            target_table: "PED".into(),
            primary_key: "OrderId".into(),
            target_primary_key: None,
            custom_query: None,
            is_detail: false,
            parent_ref: None,
            filter_condition: None,
            order_by: None,
            detail_dedup_field: None,
            field_mappings: vec![plain_field("NumPed", "OrderId")],
        }
    }

    fn mapping_with(tables: Vec<TableConfig>) -> MappingConfig {
        MappingConfig {
            id: "m1".into(),
            name: "orders".into(),
            source_server: "src".into(),
            target_server: "dst".into(),
            tables,
            consecutive: None,
            document_type_rules: vec![],
            processed_marker: None,
        }
    }

    #[test]
    fn test_valid_mapping_passes() {
        assert!(validate_mapping(&mapping_with(vec![header_table()])).is_ok());
    }

    #[test]
    fn test_rejects_no_header() {
        let mut detail = header_table();
        detail.is_detail = true;
        detail.parent_ref = Some("Orders".into());
        assert!(validate_mapping(&mapping_with(vec![detail])).is_err());
    }

    #[test]
    fn test_rejects_unresolved_parent() {
        let mut detail = header_table();
        detail.source_table = "OrderLines".into();
        detail.is_detail = true;
        detail.parent_ref = Some("Missing".into());
        let result = validate_mapping(&mapping_with(vec![header_table(), detail]));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_field_without_source() {
        let mut table = header_table();
        table.field_mappings.push(FieldMapping {
            target_field: "Orphan".into(),
            source_field: None,
            default_value: None,
            sql_function: None,
            pre_execute: false,
            function_server: Default::default(),
            value_mappings: vec![],
            strip_prefix: None,
            required: false,
        });
        assert!(validate_mapping(&mapping_with(vec![table])).is_err());
    }

    #[test]
    fn test_template_balanced_parens() {
        assert!(validate_function_template("ISNULL(@{Code}, 'X')").is_ok());
        assert!(validate_function_template("ISNULL(@{Code}, 'X'").is_err());
        assert!(validate_function_template("LEN(@{A}))").is_err());
    }

    #[test]
    fn test_template_rejects_separators_and_comments() {
        assert!(validate_function_template("1; DROP TABLE x").is_err());
        assert!(validate_function_template("1 -- x").is_err());
        assert!(validate_function_template("1 /* x */").is_err());
    }
}
