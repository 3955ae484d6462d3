//! # Progress Ledger
//!
//! Durable state for batches and their (connection, entity) units. The ledger
//! is the resume contract: a unit recorded as `completed` is never executed
//! again within the same batch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::models::sync_batch::{self, Entity as SyncBatch};
use crate::models::sync_progress::{self, Entity as SyncProgress};

/// Maximum length of error text shown in unit details.
pub const ERROR_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("unknown status '{}'", other)),
                }
            }
        }
    };
}

status_strings!(BatchStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Interrupted => "interrupted",
});

status_strings!(UnitStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

impl UnitStatus {
    /// Allowed transitions. A failed unit may re-enter `in_progress` when it is
    /// retried; terminal success is never left.
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (Failed, InProgress)
        )
    }
}

/// Identifier of the form `YYYYmmdd_HHMMSS_xxxxxx`.
pub fn generate_batch_id(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), suffix)
}

/// Aggregate view of a batch.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch: sync_batch::Model,
    pub pending: u64,
    pub in_progress: u64,
    pub skipped: u64,
    pub records_processed: i64,
    pub records_skipped: i64,
}

/// One unit as shown to an operator.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDetail {
    pub connection: String,
    pub entity: String,
    pub status: String,
    pub records_processed: i64,
    pub records_skipped: i64,
    pub write_degraded: bool,
    pub retry_count: i32,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut preview: String = text.chars().take(max).collect();
        preview.push_str("...");
        preview
    }
}

fn elapsed_ms(since: Option<DateTime<FixedOffset>>, until: DateTime<FixedOffset>) -> Option<i64> {
    since.map(|start| (until - start).num_milliseconds().max(0))
}

/// Repository over `sync_batches` and `sync_progress`.
#[derive(Clone)]
pub struct ProgressLedger {
    db: DatabaseConnection,
}

impl ProgressLedger {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a new `running` batch carrying the serialized run options.
    pub async fn create_batch(&self, options: JsonValue) -> Result<sync_batch::Model> {
        let now = now();
        let batch = sync_batch::ActiveModel {
            id: Set(generate_batch_id(now.with_timezone(&Utc))),
            status: Set(BatchStatus::Running.to_string()),
            total_tables: Set(0),
            completed_tables: Set(0),
            failed_tables: Set(0),
            degraded_tables: Set(0),
            options: Set(Some(options)),
            started_at: Set(now),
            completed_at: Set(None),
            duration_ms: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        info!(batch_id = %batch.id, "Created sync batch");
        Ok(batch)
    }

    pub async fn load_batch(&self, batch_id: &str) -> Result<sync_batch::Model> {
        SyncBatch::find_by_id(batch_id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| SyncError::BatchNotFound(batch_id.to_string()))
    }

    /// Reopen an existing batch for resumption.
    pub async fn resume_batch(&self, batch_id: &str) -> Result<sync_batch::Model> {
        let batch = self.load_batch(batch_id).await?;
        let previous = batch.status.clone();

        let mut active: sync_batch::ActiveModel = batch.into();
        active.status = Set(BatchStatus::Running.to_string());
        active.completed_at = Set(None);
        active.updated_at = Set(now());
        let batch = active.update(&self.db).await?;

        info!(batch_id = %batch.id, previous_status = %previous, "Resuming sync batch");
        Ok(batch)
    }

    pub async fn find_unit(
        &self,
        batch_id: &str,
        connection: &str,
        entity: &str,
    ) -> Result<Option<sync_progress::Model>> {
        Ok(SyncProgress::find()
            .filter(sync_progress::Column::BatchId.eq(batch_id))
            .filter(sync_progress::Column::ConnectionName.eq(connection))
            .filter(sync_progress::Column::Entity.eq(entity))
            .one(&self.db)
            .await?)
    }

    /// Fetch the unit row, creating it as `pending` the first time it is seen.
    pub async fn register_unit(
        &self,
        batch_id: &str,
        connection: &str,
        entity: &str,
    ) -> Result<sync_progress::Model> {
        if let Some(existing) = self.find_unit(batch_id, connection, entity).await? {
            return Ok(existing);
        }

        let now = now();
        let unit = sync_progress::ActiveModel {
            id: Set(Uuid::new_v4()),
            batch_id: Set(batch_id.to_string()),
            connection_name: Set(connection.to_string()),
            entity: Set(entity.to_string()),
            status: Set(UnitStatus::Pending.to_string()),
            records_processed: Set(0),
            records_skipped: Set(0),
            write_degraded: Set(false),
            error_message: Set(None),
            started_at: Set(None),
            completed_at: Set(None),
            duration_ms: Set(None),
            retry_count: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        self.refresh_batch_counts(batch_id).await?;
        Ok(unit)
    }

    /// True when the unit already completed in this batch.
    pub async fn should_skip(&self, batch_id: &str, connection: &str, entity: &str) -> Result<bool> {
        Ok(self
            .find_unit(batch_id, connection, entity)
            .await?
            .is_some_and(|unit| unit.status == UnitStatus::Completed.as_str()))
    }

    async fn transition(
        &self,
        unit: sync_progress::Model,
        next: UnitStatus,
        apply: impl FnOnce(&mut sync_progress::ActiveModel, DateTime<FixedOffset>),
    ) -> Result<sync_progress::Model> {
        let current = UnitStatus::from_str(&unit.status).unwrap_or(UnitStatus::Pending);
        if !current.can_transition_to(next) {
            warn!(
                batch_id = %unit.batch_id,
                connection = %unit.connection_name,
                entity = %unit.entity,
                from = %current,
                to = %next,
                "Ignoring invalid unit status transition"
            );
            return Ok(unit);
        }

        let now = now();
        let mut active: sync_progress::ActiveModel = unit.into();
        active.status = Set(next.to_string());
        active.updated_at = Set(now);
        apply(&mut active, now);
        Ok(active.update(&self.db).await?)
    }

    pub async fn mark_started(&self, unit: sync_progress::Model) -> Result<sync_progress::Model> {
        let retrying = unit.status == UnitStatus::Failed.as_str();
        let retry_count = unit.retry_count + i32::from(retrying);
        self.transition(unit, UnitStatus::InProgress, |active, now| {
            active.started_at = Set(Some(now));
            active.completed_at = Set(None);
            active.duration_ms = Set(None);
            active.retry_count = Set(retry_count);
        })
        .await
    }

    pub async fn mark_completed(
        &self,
        unit: sync_progress::Model,
        processed: u64,
        skipped: u64,
        degraded: bool,
    ) -> Result<sync_progress::Model> {
        let started_at = unit.started_at;
        let batch_id = unit.batch_id.clone();
        let unit = self
            .transition(unit, UnitStatus::Completed, |active, now| {
                active.records_processed = Set(processed as i64);
                active.records_skipped = Set(skipped as i64);
                active.write_degraded = Set(degraded);
                active.error_message = Set(None);
                active.completed_at = Set(Some(now));
                active.duration_ms = Set(elapsed_ms(started_at, now));
            })
            .await?;
        self.refresh_batch_counts(&batch_id).await?;
        Ok(unit)
    }

    pub async fn mark_failed(
        &self,
        unit: sync_progress::Model,
        reason: &str,
    ) -> Result<sync_progress::Model> {
        let started_at = unit.started_at;
        let batch_id = unit.batch_id.clone();
        let reason = reason.to_string();
        let unit = self
            .transition(unit, UnitStatus::Failed, |active, now| {
                active.error_message = Set(Some(reason));
                active.completed_at = Set(Some(now));
                active.duration_ms = Set(elapsed_ms(started_at, now));
            })
            .await?;
        self.refresh_batch_counts(&batch_id).await?;
        Ok(unit)
    }

    /// The unit does not apply to this connection (for example, the source table is absent).
    pub async fn mark_skipped(
        &self,
        unit: sync_progress::Model,
        reason: &str,
    ) -> Result<sync_progress::Model> {
        let started_at = unit.started_at;
        let batch_id = unit.batch_id.clone();
        let reason = reason.to_string();
        let unit = self
            .transition(unit, UnitStatus::Skipped, |active, now| {
                active.error_message = Set(Some(reason));
                active.completed_at = Set(Some(now));
                active.duration_ms = Set(elapsed_ms(started_at, now));
            })
            .await?;
        self.refresh_batch_counts(&batch_id).await?;
        Ok(unit)
    }

    /// Recompute batch counters from the unit rows.
    pub async fn refresh_batch_counts(&self, batch_id: &str) -> Result<sync_batch::Model> {
        let batch = self.load_batch(batch_id).await?;
        let units = self.units(batch_id).await?;

        let count = |status: UnitStatus| {
            units
                .iter()
                .filter(|unit| unit.status == status.as_str())
                .count() as i32
        };
        let degraded = units
            .iter()
            .filter(|unit| unit.write_degraded && unit.status == UnitStatus::Completed.as_str())
            .count() as i32;

        let mut active: sync_batch::ActiveModel = batch.into();
        active.total_tables = Set(units.len() as i32);
        active.completed_tables = Set(count(UnitStatus::Completed) + count(UnitStatus::Skipped));
        active.failed_tables = Set(count(UnitStatus::Failed));
        active.degraded_tables = Set(degraded);
        active.updated_at = Set(now());
        Ok(active.update(&self.db).await?)
    }

    async fn finish_batch(&self, batch_id: &str, status: BatchStatus) -> Result<sync_batch::Model> {
        let batch = self.refresh_batch_counts(batch_id).await?;
        let now = now();
        let started_at = batch.started_at;

        let mut active: sync_batch::ActiveModel = batch.into();
        active.status = Set(status.to_string());
        active.completed_at = Set(Some(now));
        active.duration_ms = Set(elapsed_ms(Some(started_at), now));
        active.updated_at = Set(now);
        let batch = active.update(&self.db).await?;

        info!(
            batch_id = %batch.id,
            status = %batch.status,
            total = batch.total_tables,
            completed = batch.completed_tables,
            failed = batch.failed_tables,
            degraded = batch.degraded_tables,
            duration_ms = batch.duration_ms,
            "Sync batch finished"
        );
        Ok(batch)
    }

    pub async fn complete_batch(&self, batch_id: &str) -> Result<sync_batch::Model> {
        self.finish_batch(batch_id, BatchStatus::Completed).await
    }

    pub async fn mark_interrupted(&self, batch_id: &str) -> Result<sync_batch::Model> {
        self.finish_batch(batch_id, BatchStatus::Interrupted).await
    }

    pub async fn units(&self, batch_id: &str) -> Result<Vec<sync_progress::Model>> {
        Ok(SyncProgress::find()
            .filter(sync_progress::Column::BatchId.eq(batch_id))
            .order_by_asc(sync_progress::Column::CreatedAt)
            .order_by_asc(sync_progress::Column::ConnectionName)
            .order_by_asc(sync_progress::Column::Entity)
            .all(&self.db)
            .await?)
    }

    /// Units of `connection` currently in `failed`.
    pub async fn failed_units(
        &self,
        batch_id: &str,
        connection: &str,
    ) -> Result<Vec<sync_progress::Model>> {
        Ok(SyncProgress::find()
            .filter(sync_progress::Column::BatchId.eq(batch_id))
            .filter(sync_progress::Column::ConnectionName.eq(connection))
            .filter(sync_progress::Column::Status.eq(UnitStatus::Failed.as_str()))
            .order_by_asc(sync_progress::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn summary(&self, batch_id: &str) -> Result<BatchSummary> {
        let batch = self.load_batch(batch_id).await?;
        let units = self.units(batch_id).await?;

        let count = |status: UnitStatus| {
            units
                .iter()
                .filter(|unit| unit.status == status.as_str())
                .count() as u64
        };

        Ok(BatchSummary {
            pending: count(UnitStatus::Pending),
            in_progress: count(UnitStatus::InProgress),
            skipped: count(UnitStatus::Skipped),
            records_processed: units.iter().map(|unit| unit.records_processed).sum(),
            records_skipped: units.iter().map(|unit| unit.records_skipped).sum(),
            batch,
        })
    }

    /// Per-unit view with error text truncated for display.
    pub async fn unit_details(&self, batch_id: &str) -> Result<Vec<UnitDetail>> {
        self.load_batch(batch_id).await?;
        Ok(self
            .units(batch_id)
            .await?
            .into_iter()
            .map(|unit| UnitDetail {
                connection: unit.connection_name,
                entity: unit.entity,
                status: unit.status,
                records_processed: unit.records_processed,
                records_skipped: unit.records_skipped,
                write_degraded: unit.write_degraded,
                retry_count: unit.retry_count,
                error: unit
                    .error_message
                    .as_deref()
                    .map(|message| truncate(message, ERROR_PREVIEW_CHARS)),
                duration_ms: unit.duration_ms,
            })
            .collect())
    }

    /// Most recent batches first.
    pub async fn list_batches(&self, limit: u64) -> Result<Vec<sync_batch::Model>> {
        Ok(SyncBatch::find()
            .order_by_desc(sync_batch::Column::StartedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn batch_count(&self) -> Result<u64> {
        Ok(SyncBatch::find().count(&self.db).await?)
    }
}
