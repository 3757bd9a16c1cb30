//! Error types for document transfer operations.

use thiserror::Error;

/// Main error type for transfer operations.
///
/// Per-document failures are captured into that document's outcome rather
/// than aborting the batch; only configuration-load errors and batch-level
/// cancellation abort a whole run.
#[derive(Error, Debug)]
pub enum TransferError {
    /// No stored credentials/configuration for the requested key.
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    /// Configuration exists but is structurally invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Could not obtain a connection within the acquire timeout.
    #[error("Connection unavailable for server '{server}': {message}")]
    ConnectionUnavailable { server: String, message: String },

    /// An established connection dropped mid-operation.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Referenced table does not exist on the server.
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// Referenced column does not exist on the server.
    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    /// Statement rejected by the server's parser.
    #[error("SQL syntax error{}: {message}", token.as_deref().map(|t| format!(" near '{t}'")).unwrap_or_default())]
    SqlSyntax {
        message: String,
        /// Offending token extracted from the server message, when present.
        token: Option<String>,
    },

    /// NULL written into a NOT NULL column.
    #[error("Null constraint violation: {0}")]
    NullConstraint(String),

    /// String or binary data rejected as too long for the column.
    #[error("Data truncation: {0}")]
    Truncation(String),

    /// Unique/primary key violation, or the document already exists in the
    /// target (the engine's fast-fail existence check).
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Consecutive value could not be allocated for a document.
    #[error("Consecutive allocation failed: {0}")]
    ConsecutiveAllocation(String),

    /// Run cancelled cooperatively or by the safety timeout.
    #[error("Transfer cancelled")]
    Cancelled,

    /// IO error (socket setup, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything the classifier could not place into a narrower bucket.
    #[error("{0}")]
    General(String),
}

/// SQL Server error numbers the classifier recognizes.
///
/// 102/105: syntax, 207: invalid column, 208: invalid object, 515: NULL
/// constraint, 547: constraint conflict, 2601/2627: duplicate key,
/// 2628/8152: truncation. Timeouts surface as Io/timeout from the transport.
const SYNTAX_ERRORS: &[u32] = &[102, 105, 156];
const DUPLICATE_ERRORS: &[u32] = &[2601, 2627];
const TRUNCATION_ERRORS: &[u32] = &[2628, 8152];

impl TransferError {
    /// Create a ConnectionUnavailable error.
    pub fn unavailable(server: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::ConnectionUnavailable {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a General error.
    pub fn general(message: impl Into<String>) -> Self {
        TransferError::General(message.into())
    }

    /// Stable machine-readable code for document outcomes and run reports.
    pub fn error_code(&self) -> &'static str {
        match self {
            TransferError::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            TransferError::Config(_) => "CONFIG_INVALID",
            TransferError::ConnectionUnavailable { .. } => "CONNECTION_UNAVAILABLE",
            TransferError::ConnectionLost(_) => "CONNECTION_LOST",
            TransferError::TableNotFound(_) => "TABLE_NOT_FOUND",
            TransferError::ColumnNotFound(_) => "COLUMN_NOT_FOUND",
            TransferError::SqlSyntax { .. } => "SQL_SYNTAX",
            TransferError::NullConstraint(_) => "NULL_CONSTRAINT",
            TransferError::Truncation(_) => "TRUNCATION",
            TransferError::DuplicateKey(_) => "DUPLICATE_KEY",
            TransferError::ConsecutiveAllocation(_) => "CONSECUTIVE_ALLOCATION",
            TransferError::Cancelled => "CANCELLED",
            TransferError::Io(_) => "CONNECTION_LOST",
            TransferError::Json(_) => "GENERAL",
            TransferError::General(_) => "GENERAL",
        }
    }

    /// Whether a re-run of the same document can reasonably succeed.
    ///
    /// Connection-class failures are retryable; data-shape failures
    /// (truncation, constraints, syntax) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectionUnavailable { .. }
                | TransferError::ConnectionLost(_)
                | TransferError::Io(_)
        )
    }

    /// Classify a raw server error message + number into the taxonomy.
    ///
    /// This is the single place wire-level errors are mapped; both the
    /// transport and the engine route through it so document outcomes carry
    /// consistent codes.
    pub fn classify_server_error(number: u32, message: &str) -> Self {
        match number {
            208 => TransferError::TableNotFound(first_quoted(message).unwrap_or_else(|| message.to_string())),
            207 => TransferError::ColumnNotFound(first_quoted(message).unwrap_or_else(|| message.to_string())),
            515 => TransferError::NullConstraint(message.to_string()),
            n if SYNTAX_ERRORS.contains(&n) => TransferError::SqlSyntax {
                message: message.to_string(),
                token: syntax_token(message),
            },
            n if DUPLICATE_ERRORS.contains(&n) => TransferError::DuplicateKey(message.to_string()),
            n if TRUNCATION_ERRORS.contains(&n) => TransferError::Truncation(message.to_string()),
            _ => TransferError::General(format!("server error {number}: {message}")),
        }
    }
}

impl From<tiberius::error::Error> for TransferError {
    fn from(err: tiberius::error::Error) -> Self {
        match err {
            tiberius::error::Error::Server(token) => {
                TransferError::classify_server_error(token.code(), token.message())
            }
            tiberius::error::Error::Io { message, .. } => TransferError::ConnectionLost(message),
            tiberius::error::Error::Routing { host, port } => {
                TransferError::ConnectionLost(format!("server rerouted to {host}:{port}"))
            }
            other => TransferError::General(other.to_string()),
        }
    }
}

/// Extract the token from "Incorrect syntax near 'X'"-shaped messages.
fn syntax_token(message: &str) -> Option<String> {
    let idx = message.find("near '")?;
    let rest = &message[idx + 6..];
    let end = rest.find('\'')?;
    let token = &rest[..end];
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Extract the first single-quoted fragment from a server message.
fn first_quoted(message: &str) -> Option<String> {
    let start = message.find('\'')?;
    let rest = &message[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

/// Result type alias for transfer operations.
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_table_not_found() {
        let err = TransferError::classify_server_error(208, "Invalid object name 'dbo.Orders'.");
        assert!(matches!(err, TransferError::TableNotFound(_)));
        assert_eq!(err.error_code(), "TABLE_NOT_FOUND");
        assert!(err.to_string().contains("dbo.Orders"));
    }

    #[test]
    fn test_classify_column_not_found() {
        let err = TransferError::classify_server_error(207, "Invalid column name 'LegacyRef'.");
        assert!(matches!(err, TransferError::ColumnNotFound(_)));
        assert_eq!(err.error_code(), "COLUMN_NOT_FOUND");
    }

    #[test]
    fn test_classify_syntax_extracts_token() {
        let err =
            TransferError::classify_server_error(102, "Incorrect syntax near 'FROMM'.");
        match err {
            TransferError::SqlSyntax { token, .. } => assert_eq!(token.as_deref(), Some("FROMM")),
            other => panic!("expected SqlSyntax, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_syntax_without_token() {
        let err = TransferError::classify_server_error(105, "Unclosed quotation mark.");
        match err {
            TransferError::SqlSyntax { token, .. } => assert!(token.is_none()),
            other => panic!("expected SqlSyntax, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_duplicate_and_truncation() {
        let dup = TransferError::classify_server_error(2627, "Violation of PRIMARY KEY constraint");
        assert_eq!(dup.error_code(), "DUPLICATE_KEY");

        let trunc =
            TransferError::classify_server_error(8152, "String or binary data would be truncated");
        assert_eq!(trunc.error_code(), "TRUNCATION");
    }

    #[test]
    fn test_classify_null_constraint() {
        let err = TransferError::classify_server_error(
            515,
            "Cannot insert the value NULL into column 'CustomerId'",
        );
        assert_eq!(err.error_code(), "NULL_CONSTRAINT");
    }

    #[test]
    fn test_unknown_server_error_is_general() {
        let err = TransferError::classify_server_error(50000, "custom raiserror");
        assert_eq!(err.error_code(), "GENERAL");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_connection_errors_are_retryable() {
        assert!(TransferError::ConnectionLost("reset by peer".into()).is_retryable());
        assert!(TransferError::unavailable("source", "acquire timed out").is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
    }
}
