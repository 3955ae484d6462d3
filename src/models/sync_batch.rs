//! SyncBatch entity model
//!
//! This module contains the SeaORM entity model for the sync_batches table,
//! which records one end-to-end orchestration run across connections.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

/// SyncBatch entity representing one orchestrator run
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_batches")]
pub struct Model {
    /// Batch identifier (timestamp + random suffix), used for resume
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Current status (running, completed, failed, interrupted)
    pub status: String,

    /// Number of units registered against this batch
    pub total_tables: i32,

    /// Units that finished as completed or skipped
    pub completed_tables: i32,

    /// Units whose latest attempt failed
    pub failed_tables: i32,

    /// Completed units that wrote through the insert-ignore fallback
    pub degraded_tables: i32,

    /// Serialized command options (connections, tables, skip flags)
    #[sea_orm(column_type = "JsonBinary")]
    pub options: Option<JsonValue>,

    /// Timestamp when the batch started (or was last resumed)
    pub started_at: DateTimeWithTimeZone,

    /// Timestamp when the batch reached a terminal state
    pub completed_at: Option<DateTimeWithTimeZone>,

    /// Wall-clock duration of the latest run in milliseconds
    pub duration_ms: Option<i64>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_progress::Entity")]
    SyncProgress,
}

impl Related<super::sync_progress::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncProgress.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
