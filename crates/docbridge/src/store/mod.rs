//! External collaborator traits: configuration store, history sink, and the
//! centralized sequence allocator.
//!
//! The core consumes these through `Arc<dyn ...>` without knowing the
//! concrete backend; in-memory implementations live in [`memory`] for
//! embedding and tests.

mod memory;

pub use memory::{MemoryAllocator, MemoryConfigStore, MemoryHistoryStore};

use async_trait::async_trait;

use crate::config::{MappingConfig, ServerConfig};
use crate::error::Result;
use crate::report::{RunProgress, RunReport};

/// Configuration store consumed by the pool manager and engine.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Credentials and connection settings for a server key.
    ///
    /// Fails with `ConfigNotFound` when no credentials exist.
    async fn server_config(&self, server_key: &str) -> Result<ServerConfig>;

    /// Load a mapping configuration.
    async fn mapping(&self, mapping_id: &str) -> Result<MappingConfig>;

    /// Persist a mapping configuration.
    async fn save_mapping(&self, mapping: &MappingConfig) -> Result<()>;

    /// Conditionally advance a mapping's consecutive last-value.
    ///
    /// The store applies the update only when the stored value is below
    /// `value`; returns whether it applied. This is the single field the
    /// core ever mutates on a mapping.
    async fn update_last_value(&self, mapping_id: &str, value: i64) -> Result<bool>;
}

/// Audit/history sink produced by the engine.
///
/// Fire-and-forget from the engine's view: failures are logged by the
/// caller, never fatal to a run.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist one aggregate run record.
    async fn save_run(&self, report: &RunReport) -> Result<()>;

    /// Update the live progress projection for a run.
    async fn update_progress(&self, run_id: &str, progress: RunProgress) -> Result<()>;
}

/// A batch of values reserved from the centralized allocator, not yet
/// committed.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Opaque handle used to commit or cancel.
    pub reservation_id: String,

    /// Reserved numeric values.
    pub values: Vec<i64>,
}

/// Centralized sequence allocator: two-phase reserve, then commit or
/// cancel. Expiry and reclaim of abandoned reservations is the allocator's
/// concern, not the core's.
#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    /// Reserve `count` not-yet-committed values for the given scope.
    async fn reserve(&self, consecutive_id: &str, count: u32, scope: &str) -> Result<Reservation>;

    /// Commit reserved values; a committed value is never issued again.
    async fn commit(
        &self,
        consecutive_id: &str,
        reservation_id: &str,
        values: &[i64],
    ) -> Result<()>;

    /// Cancel a reservation; its values become issuable again.
    async fn cancel(&self, consecutive_id: &str, reservation_id: &str) -> Result<()>;
}
