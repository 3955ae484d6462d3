//! One unit of work: fetch from a branch, transform, filter on dependencies,
//! write to the warehouse.

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::DatabaseConnection;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::dependency::{DependencyFilter, ParentKeySet, parent_key_column};
use crate::error::SyncError;
use crate::policy::{EntityPolicy, FetchStrategy, PolicyRegistry};
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::sources::{FetchFilter, FetchRequest, SourceReader};
use crate::transform::{Row, RowKey, RowTransformer};
use crate::writer::{TableWriter, WriteMode, WriteModeSelector};

/// Counts and keys produced by one unit.
#[derive(Debug, Clone, Default)]
pub struct UnitOutcome {
    /// Rows handed to the writer
    pub processed: u64,
    /// Rows dropped for unmet dependencies or an incomplete key
    pub skipped: u64,
    pub degraded: bool,
    pub mode: Option<WriteMode>,
    /// The relationship filter found no parent keys, nothing was fetched
    pub empty_parent: bool,
    /// Keys of every row the branch returned
    pub source_keys: Vec<RowKey>,
}

/// Inputs that vary per unit but are fixed for a batch.
#[derive(Debug, Clone, Copy)]
pub struct UnitInputs {
    pub today: NaiveDate,
    pub watermark: Option<DateTime<Utc>>,
}

/// Runs units against the warehouse with a shared configuration.
pub struct UnitRunner<'a> {
    db: &'a DatabaseConnection,
    registry: &'a PolicyRegistry,
    settings: &'a SyncSettings,
    retry: RetryPolicy,
    mode_selector: &'a dyn WriteModeSelector,
}

impl<'a> UnitRunner<'a> {
    pub fn new(
        db: &'a DatabaseConnection,
        registry: &'a PolicyRegistry,
        settings: &'a SyncSettings,
        retry: RetryPolicy,
        mode_selector: &'a dyn WriteModeSelector,
    ) -> Self {
        Self {
            db,
            registry,
            settings,
            retry,
            mode_selector,
        }
    }

    /// Same runner with a different retry budget.
    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        Self { retry, ..*self }
    }

    pub async fn run(
        &self,
        source: &dyn SourceReader,
        policy: &EntityPolicy,
        inputs: UnitInputs,
    ) -> Result<UnitOutcome, SyncError> {
        let Some(requests) = self.fetch_requests(policy, inputs).await? else {
            info!(
                connection = source.name(),
                entity = %policy.name,
                "No parent keys synced locally, nothing to fetch"
            );
            return Ok(UnitOutcome {
                empty_parent: true,
                ..UnitOutcome::default()
            });
        };

        let raw = self.fetch(source, policy, &requests).await?;
        let fetched = raw.len();

        let transformer = RowTransformer::new(policy);
        let mut rows: Vec<Row> = Vec::with_capacity(raw.len());
        let mut skipped = 0u64;
        for raw_row in raw {
            match transformer.transform_row(raw_row) {
                Ok(row) => rows.push(row),
                Err(err @ SyncError::InvalidRow { .. }) => {
                    debug!(entity = %policy.name, error = %err, "Skipping row");
                    skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        if skipped > 0 {
            warn!(
                connection = source.name(),
                entity = %policy.name,
                skipped,
                "Rows without a complete key were skipped"
            );
        }

        let source_keys: Vec<RowKey> = rows
            .iter()
            .filter_map(|row| RowKey::extract(row, transformer.key_columns()))
            .collect();

        let filter = DependencyFilter::load(self.db, policy, self.registry, &self.retry).await?;
        let filtered = filter.filter(rows);
        skipped += filtered.skipped;
        if filtered.skipped > 0 {
            info!(
                connection = source.name(),
                entity = %policy.name,
                skipped = filtered.skipped,
                "Rows with unresolved dependencies deferred to a later run"
            );
        }

        let mut outcome = UnitOutcome {
            processed: filtered.rows.len() as u64,
            skipped,
            source_keys,
            ..UnitOutcome::default()
        };

        if !filtered.rows.is_empty() {
            let table = policy.destination_table.as_str();
            let mode = execute_with_retry(&self.retry, &format!("detect mode {}", table), || {
                self.mode_selector.select(self.db, table)
            })
            .await?;

            let writer = TableWriter::new(self.db, self.settings.write_chunk_size, self.retry);
            let report = writer
                .write(table, transformer.key_columns(), &filtered.rows, mode)
                .await?;
            outcome.mode = Some(report.mode);
            outcome.degraded = report.degraded;
        }

        debug!(
            connection = source.name(),
            entity = %policy.name,
            fetched,
            processed = outcome.processed,
            skipped = outcome.skipped,
            "Unit finished"
        );
        Ok(outcome)
    }

    /// Requests for the policy's strategy; `None` when a relationship filter
    /// has no parent keys to match.
    async fn fetch_requests(
        &self,
        policy: &EntityPolicy,
        inputs: UnitInputs,
    ) -> Result<Option<Vec<FetchRequest>>, SyncError> {
        let table = policy.source_table.clone();
        let filter = match &policy.strategy {
            FetchStrategy::Full => FetchFilter::All,
            FetchStrategy::DateRange { column, window } => {
                let (start, end) = window.bounds(inputs.today);
                FetchFilter::DateRange {
                    column: column.clone(),
                    start,
                    end,
                }
            }
            FetchStrategy::Incremental {
                updated_column,
                created_column,
            } => FetchFilter::ChangedSince {
                updated_column: updated_column.clone(),
                created_column: created_column.clone(),
                since: inputs.watermark,
            },
            FetchStrategy::FallbackLatestN {
                order_column,
                limit,
            } => FetchFilter::LatestN {
                order_column: order_column.clone(),
                limit: *limit,
            },
            FetchStrategy::RelationshipFilter {
                foreign_key,
                parent,
            } => {
                let (parent_table, parent_column) = parent_key_column(self.registry, parent);
                let keys =
                    ParentKeySet::load(self.db, &parent_table, &parent_column, &self.retry).await?;
                if keys.is_empty() {
                    return Ok(None);
                }
                let requests = keys
                    .values()
                    .chunks(self.settings.key_chunk_size.max(1))
                    .map(|chunk| {
                        FetchRequest::new(
                            table.clone(),
                            FetchFilter::KeyIn {
                                column: foreign_key.clone(),
                                keys: chunk.to_vec(),
                            },
                        )
                    })
                    .collect();
                return Ok(Some(requests));
            }
        };

        Ok(Some(vec![FetchRequest::new(table, filter)]))
    }

    async fn fetch(
        &self,
        source: &dyn SourceReader,
        policy: &EntityPolicy,
        requests: &[FetchRequest],
    ) -> Result<Vec<serde_json::Value>, SyncError> {
        let label = format!("fetch {}:{}", source.name(), policy.name);
        let mut rows = Vec::new();
        for request in requests {
            let chunk = execute_with_retry(&self.retry, &label, || source.fetch(request)).await?;
            rows.extend(chunk);
        }
        Ok(rows)
    }
}
