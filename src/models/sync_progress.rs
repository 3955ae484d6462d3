//! SyncProgress entity model
//!
//! This module contains the SeaORM entity model for the sync_progress table.
//! Rows are never deleted; they form the resume ledger for their batch.

use super::sync_batch::Entity as SyncBatch;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// SyncProgress entity representing one (batch, connection, entity) unit
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_progress")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning batch identifier
    pub batch_id: String,

    /// Source connection name
    pub connection_name: String,

    /// Entity type (normalized lower-case name)
    pub entity: String,

    /// Unit status (pending, in_progress, completed, failed, skipped)
    pub status: String,

    /// Rows written to the destination
    pub records_processed: i64,

    /// Rows excluded because a required parent was missing
    pub records_skipped: i64,

    /// True when the writer fell back to insert-ignore and could not update rows
    pub write_degraded: bool,

    /// Reason for the latest failure or skip
    pub error_message: Option<String>,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub duration_ms: Option<i64>,

    /// Attempts beyond the first one for this unit within the batch
    pub retry_count: i32,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "SyncBatch",
        from = "Column::BatchId",
        to = "super::sync_batch::Column::Id"
    )]
    SyncBatch,
}

impl Related<SyncBatch> for Entity {
    fn to() -> RelationDef {
        Relation::SyncBatch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
