//! Run reports and progress projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal (or live) status of one transfer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// All documents succeeded.
    Completed,
    /// Mixed outcomes; a normal terminal state, not an error.
    Partial,
    /// All documents failed.
    Failed,
    Cancelled,
}

/// Outcome of one document within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentOutcome {
    /// Source document id.
    pub document_id: String,

    /// Whether the document landed completely.
    pub success: bool,

    /// Resolved document type ("unknown" when no rule matched).
    pub document_type: String,

    /// Target tables written for this document.
    pub processed_tables: Vec<String>,

    /// Whether a consecutive value was allocated.
    pub consecutive_used: bool,

    /// Formatted consecutive value, when allocated.
    pub consecutive_value: Option<String>,

    /// Stable error code on failure.
    pub error_code: Option<String>,

    /// Human-readable failure message.
    pub message: Option<String>,
}

/// Aggregate record of one run, persisted to the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Mapping this run executed.
    pub mapping_id: String,

    /// Terminal status.
    pub status: RunStatus,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run finished.
    pub completed_at: DateTime<Utc>,

    /// Documents requested.
    pub total: usize,

    /// Documents that landed completely.
    pub succeeded: usize,

    /// Documents that failed.
    pub failed: usize,

    /// Documents never started because the run was cancelled.
    pub skipped: usize,

    /// Successful documents per resolved document type.
    pub counts_by_type: Vec<(String, usize)>,

    /// Per-document detail list.
    pub outcomes: Vec<DocumentOutcome>,
}

/// Live projection consumed by a thin polling endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    /// Current status.
    pub status: RunStatus,

    /// Completion percentage, 0–100.
    pub progress: u8,
}
