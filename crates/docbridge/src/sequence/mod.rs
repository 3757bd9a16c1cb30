//! Consecutive (formatted sequence) allocation.
//!
//! Two strategies per mapping: a local atomically-guarded counter persisted
//! through the config store, and a centralized reserve/commit/cancel
//! protocol against an external shared allocator.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ConsecutiveConfig, MappingConfig};
use crate::error::{Result, TransferError};
use crate::store::{ConfigStore, SequenceAllocator};

/// One allocated consecutive value.
#[derive(Debug, Clone)]
pub struct Consecutive {
    /// Raw numeric value.
    pub value: i64,

    /// Formatted value written to the target field.
    pub formatted: String,

    /// Centralized reservation pending commit/cancel, if any.
    reservation: Option<PendingReservation>,
}

#[derive(Debug, Clone)]
struct PendingReservation {
    allocator_id: String,
    reservation_id: String,
    values: Vec<i64>,
}

impl Consecutive {
    /// Whether this value still needs a commit or cancel.
    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }
}

/// Hands out a monotonic, formattable sequence number per mapping.
pub struct ConsecutiveGenerator {
    config_store: Arc<dyn ConfigStore>,
    allocator: Option<Arc<dyn SequenceAllocator>>,
    /// Serializes local allocations within this process. The conditional
    /// store update is the only guard across processes (known limitation:
    /// availability is favored over strict uniqueness there).
    local_lock: Mutex<()>,
}

impl ConsecutiveGenerator {
    /// Create a generator. `allocator` is only needed for mappings using
    /// the centralized strategy.
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        allocator: Option<Arc<dyn SequenceAllocator>>,
    ) -> Self {
        Self {
            config_store,
            allocator,
            local_lock: Mutex::new(()),
        }
    }

    /// Allocate one value for a document scope.
    pub async fn allocate(&self, mapping: &MappingConfig, scope: &str) -> Result<Consecutive> {
        let config = mapping
            .consecutive
            .as_ref()
            .filter(|c| c.enabled)
            .ok_or_else(|| {
                TransferError::ConsecutiveAllocation(format!(
                    "mapping '{}' has no enabled consecutive config",
                    mapping.id
                ))
            })?;

        if config.centralized {
            self.allocate_centralized(config, scope).await
        } else {
            self.allocate_local(&mapping.id, config).await
        }
    }

    /// Settle a centralized reservation: commit on success, cancel on
    /// failure. Local allocations need no settling.
    pub async fn settle(&self, consecutive: &Consecutive, success: bool) -> Result<()> {
        let Some(reservation) = &consecutive.reservation else {
            return Ok(());
        };
        let allocator = self.allocator.as_ref().ok_or_else(|| {
            TransferError::ConsecutiveAllocation("no centralized allocator configured".into())
        })?;

        if success {
            allocator
                .commit(
                    &reservation.allocator_id,
                    &reservation.reservation_id,
                    &reservation.values,
                )
                .await
        } else {
            allocator
                .cancel(&reservation.allocator_id, &reservation.reservation_id)
                .await
        }
    }

    async fn allocate_local(
        &self,
        mapping_id: &str,
        config: &ConsecutiveConfig,
    ) -> Result<Consecutive> {
        let _guard = self.local_lock.lock().await;

        // Re-read so sequential allocations see each other's updates.
        let current = self.config_store.mapping(mapping_id).await?;
        let last = current
            .consecutive
            .as_ref()
            .map(|c| c.last_value)
            .unwrap_or(config.last_value);
        let next = last + 1;

        let applied = self.config_store.update_last_value(mapping_id, next).await?;
        if !applied {
            // A concurrent allocator advanced past us; the value is still
            // handed out (availability over strict uniqueness).
            warn!(
                mapping_id,
                value = next,
                "consecutive guard did not apply; value may collide"
            );
        }

        debug!(mapping_id, value = next, "allocated local consecutive");
        Ok(Consecutive {
            value: next,
            formatted: format_consecutive(config, next),
            reservation: None,
        })
    }

    async fn allocate_centralized(
        &self,
        config: &ConsecutiveConfig,
        scope: &str,
    ) -> Result<Consecutive> {
        let allocator = self.allocator.as_ref().ok_or_else(|| {
            TransferError::ConsecutiveAllocation("no centralized allocator configured".into())
        })?;
        let allocator_id = config.allocator_id.as_deref().ok_or_else(|| {
            TransferError::ConsecutiveAllocation("centralized config names no allocator id".into())
        })?;

        let reservation = allocator.reserve(allocator_id, 1, scope).await?;
        let value = *reservation.values.first().ok_or_else(|| {
            TransferError::ConsecutiveAllocation("allocator returned an empty reservation".into())
        })?;

        debug!(allocator_id, value, scope, "reserved centralized consecutive");
        Ok(Consecutive {
            value,
            formatted: format_consecutive(config, value),
            reservation: Some(PendingReservation {
                allocator_id: allocator_id.to_string(),
                reservation_id: reservation.reservation_id,
                values: reservation.values,
            }),
        })
    }
}

/// Format a value with today's date for the date tokens.
pub fn format_consecutive(config: &ConsecutiveConfig, value: i64) -> String {
    format_with_date(config, value, Utc::now().date_naive())
}

/// Expand the pattern tokens `{PREFIX}`, `{VALUE}`, `{VALUE:width}`,
/// `{YEAR}`, `{MONTH}`, `{DAY}`. An empty pattern yields prefix + value.
pub fn format_with_date(config: &ConsecutiveConfig, value: i64, date: NaiveDate) -> String {
    if config.pattern.is_empty() {
        return format!("{}{}", config.prefix, value);
    }

    let mut out = String::with_capacity(config.pattern.len() + 8);
    let mut rest = config.pattern.as_str();

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            // Unterminated token: emit the remainder literally.
            out.push_str(&rest[start..]);
            return out;
        };
        let token = &after[..end];

        match token {
            "PREFIX" => out.push_str(&config.prefix),
            "VALUE" => out.push_str(&value.to_string()),
            "YEAR" => out.push_str(&format!("{:04}", date.year())),
            "MONTH" => out.push_str(&format!("{:02}", date.month())),
            "DAY" => out.push_str(&format!("{:02}", date.day())),
            other => {
                if let Some(width) = other
                    .strip_prefix("VALUE:")
                    .and_then(|w| w.parse::<usize>().ok())
                {
                    out.push_str(&format!("{value:0width$}"));
                } else {
                    // Unknown token passes through untouched.
                    out.push('{');
                    out.push_str(token);
                    out.push('}');
                }
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}
