//! Document transfer engine - per-run workflow coordinator.
//!
//! Moves each document's header and detail rows from source to target per
//! mapping rules, reporting a structured per-document outcome. Documents
//! are processed strictly sequentially over one source/target connection
//! pair; one document's failure never aborts the batch.

mod pipeline;
mod transform;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{validate_mapping, MappingConfig, ProcessedMarker};
use crate::engine::pipeline::process_document;
use crate::engine::transform::ColumnLengths;
use crate::error::{Result, TransferError};
use crate::ident::{qualify_table, quote_ident};
use crate::pool::{ConnectionPoolManager, ErrorClass, PooledConnection};
use crate::report::{DocumentOutcome, RunProgress, RunReport, RunStatus};
use crate::sequence::{Consecutive, ConsecutiveGenerator};
use crate::store::HistoryStore;
use crate::transport::Transport;
use crate::value::SqlValue;

/// Engine tuning parameters.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Connection-acquisition attempts per server before the run fails.
    pub acquire_attempts: u32,

    /// Base delay between acquisition attempts (doubled each retry).
    pub acquire_backoff: Duration,

    /// Safety timeout cancelling the run if the caller forgot to.
    pub safety_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            acquire_attempts: 3,
            acquire_backoff: Duration::from_secs(1),
            safety_timeout: Duration::from_secs(120),
        }
    }
}

/// Orchestrates the per-document pipeline across a batch.
pub struct DocumentTransferEngine<T: Transport> {
    pools: Arc<ConnectionPoolManager<T>>,
    history: Arc<dyn HistoryStore>,
    generator: Arc<ConsecutiveGenerator>,
    settings: EngineSettings,
}

impl<T: Transport> DocumentTransferEngine<T> {
    /// Create an engine with default settings.
    pub fn new(
        pools: Arc<ConnectionPoolManager<T>>,
        history: Arc<dyn HistoryStore>,
        generator: Arc<ConsecutiveGenerator>,
    ) -> Self {
        Self::with_settings(pools, history, generator, EngineSettings::default())
    }

    /// Create an engine with explicit settings.
    pub fn with_settings(
        pools: Arc<ConnectionPoolManager<T>>,
        history: Arc<dyn HistoryStore>,
        generator: Arc<ConsecutiveGenerator>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pools,
            history,
            generator,
            settings,
        }
    }

    /// Process a batch of documents against a mapping.
    ///
    /// Documents run in input order; cancellation is checked once per
    /// document boundary. Partial success is a normal terminal state. Both
    /// connections are always released in a final step, whatever the
    /// outcome.
    pub async fn process_documents(
        &self,
        document_ids: &[String],
        mapping: &MappingConfig,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        validate_mapping(mapping)?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let started = Instant::now();
        let total = document_ids.len();
        info!(%run_id, mapping = %mapping.id, total, "starting transfer run");

        let mut source = self.acquire_verified(&mapping.source_server).await?;
        let mut target = match self.acquire_verified(&mapping.target_server).await {
            Ok(conn) => conn,
            Err(e) => {
                // Release is fire-and-forget by design.
                let _ = self.pools.release(source).await;
                return Err(e);
            }
        };

        self.post_progress(&run_id, RunStatus::Running, 0).await;

        let mut outcomes: Vec<DocumentOutcome> = Vec::with_capacity(total);
        let mut lengths = ColumnLengths::new();
        let mut cancelled = false;

        for (index, document_id) in document_ids.iter().enumerate() {
            // Cooperative cancellation and the safety timeout share this
            // single per-document checkpoint.
            if cancel.is_cancelled() || started.elapsed() >= self.settings.safety_timeout {
                cancelled = true;
                break;
            }

            let outcome = self
                .process_one(mapping, document_id, &mut source, &mut target, &mut lengths)
                .await;
            if !outcome.success {
                warn!(
                    %run_id,
                    document_id,
                    code = outcome.error_code.as_deref().unwrap_or(""),
                    "document failed"
                );
            }
            outcomes.push(outcome);

            let progress = (((index + 1) * 100) / total.max(1)) as u8;
            self.post_progress(&run_id, RunStatus::Running, progress).await;
        }

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let failed = outcomes.len() - succeeded;
        let skipped = total - outcomes.len();

        let status = if cancelled {
            RunStatus::Cancelled
        } else if failed == 0 {
            RunStatus::Completed
        } else if succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        };

        let mut by_type: HashMap<String, usize> = HashMap::new();
        for outcome in outcomes.iter().filter(|o| o.success) {
            *by_type.entry(outcome.document_type.clone()).or_default() += 1;
        }
        let mut counts_by_type: Vec<(String, usize)> = by_type.into_iter().collect();
        counts_by_type.sort();

        let report = RunReport {
            run_id: run_id.clone(),
            mapping_id: mapping.id.clone(),
            status,
            started_at,
            completed_at: Utc::now(),
            total,
            succeeded,
            failed,
            skipped,
            counts_by_type,
            outcomes,
        };

        if let Err(e) = self.history.save_run(&report).await {
            warn!(%run_id, error = %e, "failed to persist run record");
        }
        let final_progress = ((report.total - report.skipped) * 100 / report.total.max(1)) as u8;
        self.post_progress(&run_id, status, final_progress).await;

        info!(
            %run_id,
            status = ?status,
            succeeded,
            failed,
            skipped,
            "transfer run finished"
        );

        // Always release both connections; failures here must not mask the
        // run result.
        let _ = future::join(self.pools.release(source), self.pools.release(target)).await;

        Ok(report)
    }

    /// Run one document end to end, converting every failure into its
    /// outcome record.
    async fn process_one(
        &self,
        mapping: &MappingConfig,
        document_id: &str,
        source: &mut PooledConnection<T>,
        target: &mut PooledConnection<T>,
        lengths: &mut ColumnLengths,
    ) -> DocumentOutcome {
        let consecutive: Option<Consecutive> =
            match mapping.consecutive.as_ref().filter(|c| c.enabled) {
                Some(_) => match self.generator.allocate(mapping, document_id).await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        return failed_outcome(document_id, false, &e);
                    }
                },
                None => None,
            };

        let result = process_document(
            mapping,
            document_id,
            consecutive.as_ref(),
            source,
            target,
            lengths,
        )
        .await;

        match result {
            Ok(pipeline) => {
                if let Some(c) = &consecutive {
                    if let Err(e) = self.generator.settle(c, true).await {
                        warn!(document_id, error = %e, "failed to commit consecutive");
                    }
                }

                if let Some(marker) = &mapping.processed_marker {
                    if let Some((table, key)) = &pipeline.marker_table {
                        if let Err(e) =
                            write_marker(source, table, key, marker, document_id).await
                        {
                            // Marker writeback is best-effort.
                            warn!(document_id, error = %e, "failed to write processed marker");
                        }
                    }
                }

                DocumentOutcome {
                    document_id: document_id.to_string(),
                    success: true,
                    document_type: pipeline.document_type,
                    processed_tables: pipeline.processed_tables,
                    consecutive_used: consecutive.is_some(),
                    consecutive_value: consecutive.map(|c| c.formatted),
                    error_code: None,
                    message: None,
                }
            }
            Err(e) => {
                if let Some(c) = &consecutive {
                    if let Err(cancel_err) = self.generator.settle(c, false).await {
                        warn!(document_id, error = %cancel_err, "failed to cancel consecutive");
                    }
                }

                if e.is_retryable() {
                    // One reconnect attempt so the rest of the batch can
                    // proceed; the document itself stays failed-retryable.
                    self.refresh_dead_connections(mapping, source, target).await;
                }

                failed_outcome(document_id, consecutive.is_some(), &e)
            }
        }
    }

    /// Acquire a connection, verifying it with a trivial query, retrying
    /// with 1 s/2 s/4 s backoff.
    async fn acquire_verified(&self, server_key: &str) -> Result<PooledConnection<T>> {
        let mut last_error: Option<TransferError> = None;

        for attempt in 1..=self.settings.acquire_attempts {
            match self.pools.acquire(server_key).await {
                Ok(mut conn) => match conn.query("SELECT 1", &[]).await {
                    Ok(_) => return Ok(conn),
                    Err(e) => {
                        warn!(key = server_key, attempt, error = %e, "connection verification failed");
                        let _ = self.pools.release(conn).await;
                        self.pools.record_error(server_key, ErrorClass::Generic).await;
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    warn!(key = server_key, attempt, error = %e, "connection acquisition failed");
                    if matches!(e, TransferError::ConfigNotFound(_)) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }

            if attempt < self.settings.acquire_attempts {
                let delay = self
                    .settings
                    .acquire_backoff
                    .checked_mul(1 << (attempt - 1).min(16))
                    .unwrap_or(self.settings.acquire_backoff);
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransferError::unavailable(server_key, "connection acquisition failed")
        }))
    }

    /// Probe both connections and replace any that died, once.
    async fn refresh_dead_connections(
        &self,
        mapping: &MappingConfig,
        source: &mut PooledConnection<T>,
        target: &mut PooledConnection<T>,
    ) {
        if source.query("SELECT 1", &[]).await.is_err() {
            self.pools
                .record_error(&mapping.source_server, ErrorClass::Generic)
                .await;
            if let Ok(fresh) = self.pools.acquire(&mapping.source_server).await {
                debug!(key = %mapping.source_server, "replaced dead source connection");
                let old = std::mem::replace(source, fresh);
                let _ = self.pools.release(old).await;
            }
        }

        if target.query("SELECT 1", &[]).await.is_err() {
            self.pools
                .record_error(&mapping.target_server, ErrorClass::Generic)
                .await;
            if let Ok(fresh) = self.pools.acquire(&mapping.target_server).await {
                debug!(key = %mapping.target_server, "replaced dead target connection");
                let old = std::mem::replace(target, fresh);
                let _ = self.pools.release(old).await;
            }
        }
    }

    async fn post_progress(&self, run_id: &str, status: RunStatus, progress: u8) {
        if let Err(e) = self
            .history
            .update_progress(run_id, RunProgress { status, progress })
            .await
        {
            warn!(run_id, error = %e, "failed to update run progress");
        }
    }
}

fn failed_outcome(document_id: &str, consecutive_used: bool, error: &TransferError) -> DocumentOutcome {
    DocumentOutcome {
        document_id: document_id.to_string(),
        success: false,
        document_type: "unknown".to_string(),
        processed_tables: Vec::new(),
        consecutive_used,
        consecutive_value: None,
        error_code: Some(error.error_code().to_string()),
        message: Some(error.to_string()),
    }
}

async fn write_marker<T: Transport>(
    source: &mut PooledConnection<T>,
    table: &str,
    key_column: &str,
    marker: &ProcessedMarker,
    document_id: &str,
) -> Result<()> {
    let sql = format!(
        "UPDATE {} SET {} = @P1 WHERE {} = @P2",
        qualify_table(table)?,
        quote_ident(&marker.field)?,
        quote_ident(key_column)?
    );
    source
        .execute(
            &sql,
            &[
                SqlValue::Text(marker.value.clone()),
                SqlValue::Text(document_id.to_string()),
            ],
        )
        .await?;
    Ok(())
}
