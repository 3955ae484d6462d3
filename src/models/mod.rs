//! # Data Models
//!
//! SeaORM entities for the durable sync ledger: one `sync_batches` row per
//! orchestrator run and one `sync_progress` row per unit of work.

pub mod sync_batch;
pub mod sync_progress;

pub use sync_batch::Entity as SyncBatch;
pub use sync_progress::Entity as SyncProgress;
