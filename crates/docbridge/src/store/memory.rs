//! In-memory store implementations for embedding and tests.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{ConfigStore, HistoryStore, Reservation, SequenceAllocator};
use crate::config::{MappingConfig, ServerConfig};
use crate::error::{Result, TransferError};
use crate::report::{RunProgress, RunReport};

/// In-memory configuration store.
#[derive(Default)]
pub struct MemoryConfigStore {
    servers: Mutex<HashMap<String, ServerConfig>>,
    mappings: Mutex<HashMap<String, MappingConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server configuration under a key.
    pub fn put_server(&self, key: impl Into<String>, config: ServerConfig) {
        self.servers.lock().insert(key.into(), config);
    }

    /// Register a mapping configuration.
    pub fn put_mapping(&self, mapping: MappingConfig) {
        self.mappings
            .lock()
            .insert(mapping.id.clone(), mapping);
    }

    /// Current stored last-value for a mapping's consecutive config.
    pub fn last_value(&self, mapping_id: &str) -> Option<i64> {
        self.mappings
            .lock()
            .get(mapping_id)
            .and_then(|m| m.consecutive.as_ref())
            .map(|c| c.last_value)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn server_config(&self, server_key: &str) -> Result<ServerConfig> {
        self.servers
            .lock()
            .get(server_key)
            .cloned()
            .ok_or_else(|| TransferError::ConfigNotFound(format!("server '{server_key}'")))
    }

    async fn mapping(&self, mapping_id: &str) -> Result<MappingConfig> {
        self.mappings
            .lock()
            .get(mapping_id)
            .cloned()
            .ok_or_else(|| TransferError::ConfigNotFound(format!("mapping '{mapping_id}'")))
    }

    async fn save_mapping(&self, mapping: &MappingConfig) -> Result<()> {
        self.mappings
            .lock()
            .insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    async fn update_last_value(&self, mapping_id: &str, value: i64) -> Result<bool> {
        let mut mappings = self.mappings.lock();
        let mapping = mappings
            .get_mut(mapping_id)
            .ok_or_else(|| TransferError::ConfigNotFound(format!("mapping '{mapping_id}'")))?;
        let consecutive = mapping.consecutive.as_mut().ok_or_else(|| {
            TransferError::Config(format!("mapping '{mapping_id}' has no consecutive config"))
        })?;

        if consecutive.last_value < value {
            consecutive.last_value = value;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// In-memory history sink.
#[derive(Default)]
pub struct MemoryHistoryStore {
    runs: Mutex<Vec<RunReport>>,
    progress: Mutex<HashMap<String, RunProgress>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted run reports, oldest first.
    pub fn runs(&self) -> Vec<RunReport> {
        self.runs.lock().clone()
    }

    /// Latest progress projection for a run.
    pub fn progress(&self, run_id: &str) -> Option<RunProgress> {
        self.progress.lock().get(run_id).copied()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn save_run(&self, report: &RunReport) -> Result<()> {
        self.runs.lock().push(report.clone());
        Ok(())
    }

    async fn update_progress(&self, run_id: &str, progress: RunProgress) -> Result<()> {
        self.progress
            .lock()
            .insert(run_id.to_string(), progress);
        Ok(())
    }
}

#[derive(Default)]
struct SequenceState {
    next: i64,
    /// Cancelled values available for re-issue, drawn smallest-first.
    free: BTreeSet<i64>,
    outstanding: HashMap<String, Vec<i64>>,
    committed: BTreeSet<i64>,
}

/// In-memory centralized allocator honoring the reserve/commit/cancel
/// protocol: committed values are never re-issued, cancelled values are.
#[derive(Default)]
pub struct MemoryAllocator {
    sequences: Mutex<HashMap<String, SequenceState>>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the starting point of a sequence.
    pub fn set_next(&self, consecutive_id: &str, next: i64) {
        self.sequences
            .lock()
            .entry(consecutive_id.to_string())
            .or_default()
            .next = next;
    }
}

#[async_trait]
impl SequenceAllocator for MemoryAllocator {
    async fn reserve(&self, consecutive_id: &str, count: u32, _scope: &str) -> Result<Reservation> {
        let mut sequences = self.sequences.lock();
        let state = sequences.entry(consecutive_id.to_string()).or_default();

        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let reusable = state.free.iter().next().copied();
            match reusable {
                Some(v) => {
                    state.free.remove(&v);
                    values.push(v);
                }
                None => {
                    state.next += 1;
                    values.push(state.next);
                }
            }
        }

        let reservation_id = Uuid::new_v4().to_string();
        state.outstanding.insert(reservation_id.clone(), values.clone());
        Ok(Reservation {
            reservation_id,
            values,
        })
    }

    async fn commit(
        &self,
        consecutive_id: &str,
        reservation_id: &str,
        values: &[i64],
    ) -> Result<()> {
        let mut sequences = self.sequences.lock();
        let state = sequences
            .get_mut(consecutive_id)
            .ok_or_else(|| TransferError::ConsecutiveAllocation(format!(
                "unknown sequence '{consecutive_id}'"
            )))?;

        state.outstanding.remove(reservation_id).ok_or_else(|| {
            TransferError::ConsecutiveAllocation(format!("unknown reservation '{reservation_id}'"))
        })?;
        state.committed.extend(values.iter().copied());
        Ok(())
    }

    async fn cancel(&self, consecutive_id: &str, reservation_id: &str) -> Result<()> {
        let mut sequences = self.sequences.lock();
        let state = sequences
            .get_mut(consecutive_id)
            .ok_or_else(|| TransferError::ConsecutiveAllocation(format!(
                "unknown sequence '{consecutive_id}'"
            )))?;

        if let Some(values) = state.outstanding.remove(reservation_id) {
            state.free.extend(values);
        }
        Ok(())
    }
}
