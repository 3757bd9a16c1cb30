//! Identifier validation and quoting for dynamically assembled statements.
//!
//! Table and column names come from externally authored mapping
//! configurations and cannot be bound as statement parameters, so every
//! dynamically assembled statement routes its identifiers through these
//! helpers: validate for suspicious patterns, then bracket-quote with
//! escaping.

use crate::error::{Result, TransferError};

/// Maximum identifier length accepted (SQL Server limit).
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes, and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransferError::Config("Identifier cannot be empty".into()));
    }

    if name.contains('\0') {
        return Err(TransferError::Config(format!(
            "Identifier contains null byte (possible injection attempt): {name:?}"
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(TransferError::Config(format!(
            "Identifier exceeds maximum length of {MAX_IDENTIFIER_LENGTH} bytes: {name:?}"
        )));
    }

    Ok(())
}

/// Quote a SQL Server identifier using brackets, escaping closing brackets
/// by doubling them. Validates the identifier before quoting.
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("[{}]", name.replace(']', "]]")))
}

/// Qualify a table reference, accepting either `table` or `schema.table`.
pub fn qualify_table(name: &str) -> Result<String> {
    match name.split_once('.') {
        Some((schema, table)) => Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?)),
        None => quote_ident(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_normal() {
        assert_eq!(quote_ident("Orders").unwrap(), "[Orders]");
        assert_eq!(quote_ident("order_line").unwrap(), "[order_line]");
    }

    #[test]
    fn test_quote_escapes_bracket() {
        assert_eq!(quote_ident("a]b").unwrap(), "[a]]b]");
    }

    #[test]
    fn test_rejects_empty_and_null_byte() {
        assert!(quote_ident("").is_err());
        assert!(quote_ident("tab\0le").is_err());
    }

    #[test]
    fn test_rejects_too_long() {
        let long = "a".repeat(MAX_IDENTIFIER_LENGTH + 1);
        assert!(validate_identifier(&long).is_err());
        assert!(validate_identifier(&"a".repeat(MAX_IDENTIFIER_LENGTH)).is_ok());
    }

    #[test]
    fn test_injection_attempt_safely_quoted() {
        let quoted = quote_ident("Orders]; DROP TABLE Orders;--").unwrap();
        assert_eq!(quoted, "[Orders]]; DROP TABLE Orders;--]");
    }

    #[test]
    fn test_qualify_with_schema() {
        assert_eq!(qualify_table("dbo.Orders").unwrap(), "[dbo].[Orders]");
        assert_eq!(qualify_table("Orders").unwrap(), "[Orders]");
    }
}
