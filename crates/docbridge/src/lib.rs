//! # docbridge
//!
//! Rule-driven transfer of individual business documents (orders, invoices,
//! loads) between two independently-schemed SQL Server instances.
//!
//! The crate provides:
//!
//! - **Connection pooling** that keeps authenticated sessions to flaky
//!   remote servers alive, bounded, and never hands a caller a broken
//!   connection
//! - **Per-document transform/load** across header/detail table pairs
//!   declared in an externally authored mapping configuration
//! - **Consecutive allocation**: formatted sequence numbers, locally
//!   guarded or drawn from a centralized reserve/commit/cancel allocator
//! - **Error classification** of heterogeneous database failures into a
//!   stable, actionable taxonomy
//!
//! Documents are processed sequentially per run without multi-statement
//! transactions; the target existence check and the detail dedup probe make
//! re-runs safe after partial writes.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use docbridge::{
//!     ConnectionPoolManager, ConsecutiveGenerator, DocumentTransferEngine, TdsTransport,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(
//! #     config_store: Arc<dyn docbridge::ConfigStore>,
//! #     history: Arc<dyn docbridge::HistoryStore>,
//! # ) -> docbridge::Result<()> {
//! let transport = Arc::new(TdsTransport::new());
//! let pools = ConnectionPoolManager::new(transport, config_store.clone());
//! pools.start().await;
//!
//! let generator = Arc::new(ConsecutiveGenerator::new(config_store.clone(), None));
//! let engine = DocumentTransferEngine::new(pools.clone(), history, generator);
//!
//! let mapping = config_store.mapping("orders-to-erp").await?;
//! let ids = vec!["1001".to_string(), "1002".to_string()];
//! let report = engine
//!     .process_documents(&ids, &mapping, CancellationToken::new())
//!     .await?;
//! println!("{} of {} documents transferred", report.succeeded, report.total);
//!
//! pools.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod ident;
pub mod pool;
pub mod report;
pub mod sequence;
pub mod store;
pub mod transport;
pub mod value;

// Re-exports for convenient access
pub use config::{
    ConsecutiveConfig, DocumentTypeRule, FieldMapping, MappingConfig, ServerConfig, TableConfig,
};
pub use engine::{DocumentTransferEngine, EngineSettings};
pub use error::{Result, TransferError};
pub use pool::{ConnectionPoolManager, PoolSettings, PooledConnection};
pub use report::{DocumentOutcome, RunProgress, RunReport, RunStatus};
pub use sequence::{Consecutive, ConsecutiveGenerator};
pub use store::{ConfigStore, HistoryStore, Reservation, SequenceAllocator};
pub use transport::{QueryResult, TdsTransport, Transport};
pub use value::SqlValue;
