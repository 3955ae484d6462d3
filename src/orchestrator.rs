//! # Batch Orchestrator
//!
//! Sequences entity types across branch connections:
//!
//! 1. Phase 1: single-source entities from the canonical connection (skipped
//!    for connection-scoped runs or on request).
//! 2. Phase 2: for each connection in scope, single-source entities (only when
//!    connection-scoped), then full-sync entities, then filtered entities,
//!    followed by one final retry of that connection's failed units.
//! 3. Pruning of full-sync entities and advancing incremental watermarks, both
//!    only when every connection covered the entity during this run.
//!
//! Unit failures never abort a batch. The batch always finishes `completed`
//! (or `interrupted` when cancelled between units); failed units stay in the
//! ledger for follow-up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::config::SyncSettings;
use crate::error::{Result, SyncError};
use crate::ledger::{BatchStatus, ProgressLedger, UnitStatus};
use crate::models::sync_batch;
use crate::pipeline::{UnitInputs, UnitRunner};
use crate::policy::{EntityPolicy, FetchStrategy, PolicyRegistry, SyncGroup};
use crate::prune::{KeyPruner, Pruner};
use crate::retry::RetryPolicy;
use crate::sources::SourceRegistry;
use crate::telemetry::{batch_span, unit_span};
use crate::transform::RowKey;
use crate::watermark::WatermarkStore;
use crate::writer::{DetectFromDestination, WriteModeSelector};

/// Options of one orchestrator run. Persisted with the batch so a resume
/// replays the same scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Restrict the run to these connections; empty means all
    #[serde(default)]
    pub connections: Vec<String>,
    /// Restrict the run to these entity types; empty means all registered
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub skip_phase1: bool,
    /// Continue an existing batch instead of creating one
    #[serde(skip)]
    pub resume: Option<String>,
}

impl BatchOptions {
    pub fn is_connection_scoped(&self) -> bool {
        !self.connections.is_empty()
    }
}

/// A unit that still failed after the final retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub connection: String,
    pub entity: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch: sync_batch::Model,
    pub status: BatchStatus,
    pub resumed: bool,
    /// Units left in `failed` that need manual follow-up
    pub manual_intervention: Vec<UnitFailure>,
    /// Deleted row counts per pruned entity
    pub pruned: Vec<(String, u64)>,
    pub watermarks_advanced: Vec<String>,
}

/// Per-run state passed to every orchestration step.
#[derive(Debug)]
pub struct BatchContext {
    pub batch_id: String,
    pub options: BatchOptions,
    pub resumed: bool,
    pub started_at: DateTime<Utc>,
    pub connections: Vec<String>,
    pub policies: Vec<EntityPolicy>,
    watermarks: HashMap<String, Option<DateTime<Utc>>>,
    /// entity -> connections that fully processed it during this run
    coverage: HashMap<String, HashSet<String>>,
    /// entity -> upstream keys seen during this run, for pruned entities
    upstream_keys: HashMap<String, HashSet<RowKey>>,
}

impl BatchContext {
    fn today(&self) -> NaiveDate {
        self.started_at.date_naive()
    }

    fn inputs_for(&self, policy: &EntityPolicy) -> UnitInputs {
        UnitInputs {
            today: self.today(),
            watermark: self.watermarks.get(&policy.name).copied().flatten(),
        }
    }

    fn policies_in(&self, group: SyncGroup) -> Vec<EntityPolicy> {
        self.policies
            .iter()
            .filter(|policy| policy.group == group)
            .cloned()
            .collect()
    }

    fn policy(&self, entity: &str) -> Option<&EntityPolicy> {
        self.policies.iter().find(|policy| policy.name == entity)
    }

    fn record_coverage(&mut self, connection: &str, entity: &str) {
        self.coverage
            .entry(entity.to_string())
            .or_default()
            .insert(connection.to_string());
    }

    /// True when every connection of the run processed `entity` in this run.
    fn fully_covered(&self, entity: &str) -> bool {
        !self.options.is_connection_scoped()
            && self.coverage.get(entity).is_some_and(|covered| {
                self.connections
                    .iter()
                    .all(|connection| covered.contains(connection))
            })
    }
}

enum UnitResult {
    Completed,
    AlreadyDone,
    Failed(String),
}

pub struct Orchestrator {
    db: DatabaseConnection,
    sources: SourceRegistry,
    registry: PolicyRegistry,
    settings: SyncSettings,
    ledger: ProgressLedger,
    watermarks: WatermarkStore,
    mode_selector: Arc<dyn WriteModeSelector>,
    pruner: Arc<dyn Pruner>,
    retry: RetryPolicy,
    final_retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        db: DatabaseConnection,
        sources: SourceRegistry,
        registry: PolicyRegistry,
        settings: SyncSettings,
    ) -> Self {
        let retry = RetryPolicy::from_settings(&settings);
        Self {
            ledger: ProgressLedger::new(db.clone()),
            watermarks: WatermarkStore::new(settings.watermark_dir.clone()),
            mode_selector: Arc::new(DetectFromDestination),
            pruner: Arc::new(KeyPruner::new(settings.key_chunk_size, retry)),
            final_retry: RetryPolicy::final_phase(&settings),
            retry,
            db,
            sources,
            registry,
            settings,
        }
    }

    pub fn with_mode_selector(mut self, selector: Arc<dyn WriteModeSelector>) -> Self {
        self.mode_selector = selector;
        self
    }

    pub fn with_pruner(mut self, pruner: Arc<dyn Pruner>) -> Self {
        self.pruner = pruner;
        self
    }

    pub fn with_retry_policies(mut self, retry: RetryPolicy, final_retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.final_retry = final_retry;
        self
    }

    pub fn ledger(&self) -> &ProgressLedger {
        &self.ledger
    }

    /// Run (or resume) a batch.
    ///
    /// Fails only on preconditions: no connections, an unknown connection
    /// name or an unknown resume identifier.
    pub async fn run_batch(
        &self,
        options: BatchOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        let mut ctx = self.prepare(options).await?;
        let span = batch_span(&ctx.batch_id);
        self.execute(&mut ctx, cancel).instrument(span).await
    }

    async fn prepare(&self, options: BatchOptions) -> Result<BatchContext> {
        if self.sources.is_empty() {
            return Err(SyncError::NoConnections);
        }

        let (batch, options, resumed) = match options.resume.clone() {
            Some(batch_id) => {
                let batch = self.ledger.load_batch(&batch_id).await?;
                let stored = batch
                    .options
                    .clone()
                    .and_then(|value| serde_json::from_value::<BatchOptions>(value).ok())
                    .unwrap_or_else(|| options.clone());
                if options.is_connection_scoped() || !options.entities.is_empty() || options.skip_phase1 {
                    warn!(batch_id = %batch_id, "Ignoring run options on resume; replaying the stored ones");
                }
                self.validate_connections(&stored)?;
                let batch = self.ledger.resume_batch(&batch_id).await?;
                (batch, stored, true)
            }
            None => {
                self.validate_connections(&options)?;
                let stored = serde_json::to_value(&options)?;
                (self.ledger.create_batch(stored).await?, options, false)
            }
        };

        let connections = if options.is_connection_scoped() {
            options.connections.clone()
        } else {
            self.sources.names().to_vec()
        };
        let filter = (!options.entities.is_empty()).then_some(options.entities.as_slice());
        let policies = self
            .registry
            .select(filter, self.settings.fallback_row_limit);

        let mut watermarks = HashMap::new();
        for policy in &policies {
            if matches!(policy.strategy, FetchStrategy::Incremental { .. }) {
                watermarks.insert(policy.name.clone(), self.watermarks.read(&policy.name).await?);
            }
        }

        Ok(BatchContext {
            batch_id: batch.id,
            options,
            resumed,
            started_at: Utc::now(),
            connections,
            policies,
            watermarks,
            coverage: HashMap::new(),
            upstream_keys: HashMap::new(),
        })
    }

    fn validate_connections(&self, options: &BatchOptions) -> Result<()> {
        for name in &options.connections {
            self.sources.get(name)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &mut BatchContext,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        info!(
            resumed = ctx.resumed,
            connections = ctx.connections.len(),
            entities = ctx.policies.len(),
            "Starting sync batch"
        );

        let runner = UnitRunner::new(
            &self.db,
            &self.registry,
            &self.settings,
            self.retry,
            self.mode_selector.as_ref(),
        );
        let mut manual_intervention = Vec::new();

        if !ctx.options.is_connection_scoped() && !ctx.options.skip_phase1 {
            match self.sources.canonical().map(str::to_string) {
                Some(canonical) => {
                    info!(connection = %canonical, "Phase 1: single-source entities");
                    for policy in ctx.policies_in(SyncGroup::SingleSource) {
                        if cancel.is_cancelled() {
                            return self.interrupt(ctx).await;
                        }
                        self.run_unit(ctx, &runner, &canonical, &policy).await?;
                    }
                }
                None => warn!("No canonical connection, skipping phase 1"),
            }
        }

        let connections = ctx.connections.clone();
        for connection in &connections {
            info!(connection = %connection, "Phase 2: syncing connection");

            let mut groups = Vec::with_capacity(3);
            if ctx.options.is_connection_scoped() {
                groups.push(SyncGroup::SingleSource);
            }
            groups.extend([SyncGroup::Full, SyncGroup::Filtered]);

            for group in groups {
                for policy in ctx.policies_in(group) {
                    if cancel.is_cancelled() {
                        return self.interrupt(ctx).await;
                    }
                    self.run_unit(ctx, &runner, connection, &policy).await?;
                }
            }

            if cancel.is_cancelled() {
                return self.interrupt(ctx).await;
            }
            manual_intervention.extend(self.final_retry(ctx, &runner, connection, cancel).await?);
        }

        if cancel.is_cancelled() {
            return self.interrupt(ctx).await;
        }

        let pruned = self.prune(ctx).await;
        let watermarks_advanced = self.advance_watermarks(ctx).await;

        let batch = self.ledger.complete_batch(&ctx.batch_id).await?;
        if !manual_intervention.is_empty() {
            error!(
                failed_units = manual_intervention.len(),
                "Batch completed with units requiring manual intervention"
            );
        }

        Ok(BatchResult {
            batch,
            status: BatchStatus::Completed,
            resumed: ctx.resumed,
            manual_intervention,
            pruned,
            watermarks_advanced,
        })
    }

    async fn interrupt(&self, ctx: &BatchContext) -> Result<BatchResult> {
        warn!("Cancellation requested, stopping before the next unit");
        let batch = self.ledger.mark_interrupted(&ctx.batch_id).await?;
        Ok(BatchResult {
            batch,
            status: BatchStatus::Interrupted,
            resumed: ctx.resumed,
            manual_intervention: Vec::new(),
            pruned: Vec::new(),
            watermarks_advanced: Vec::new(),
        })
    }

    async fn run_unit(
        &self,
        ctx: &mut BatchContext,
        runner: &UnitRunner<'_>,
        connection: &str,
        policy: &EntityPolicy,
    ) -> Result<UnitResult> {
        let entity = policy.name.as_str();

        if self.ledger.should_skip(&ctx.batch_id, connection, entity).await? {
            info!(connection, entity, "Unit already completed in this batch, skipping");
            return Ok(UnitResult::AlreadyDone);
        }

        let unit = self
            .ledger
            .register_unit(&ctx.batch_id, connection, entity)
            .await?;
        if unit.status == UnitStatus::Skipped.as_str() {
            return Ok(UnitResult::AlreadyDone);
        }

        let source = self.sources.get(connection)?;
        let unit = self.ledger.mark_started(unit).await?;
        let attempt = unit.retry_count + 1;

        let started = Instant::now();
        let result = runner
            .run(source.as_ref(), policy, ctx.inputs_for(policy))
            .instrument(unit_span(connection, entity))
            .await;
        histogram!("sync_unit_duration_ms", "entity" => entity.to_string())
            .record(started.elapsed().as_millis() as f64);

        match result {
            Ok(outcome) => {
                self.ledger
                    .mark_completed(unit, outcome.processed, outcome.skipped, outcome.degraded)
                    .await?;
                counter!("sync_rows_processed_total", "entity" => entity.to_string())
                    .increment(outcome.processed);
                counter!("sync_rows_skipped_total", "entity" => entity.to_string())
                    .increment(outcome.skipped);
                if outcome.degraded {
                    warn!(
                        batch_id = %ctx.batch_id,
                        connection,
                        entity,
                        "Unit completed with degraded writes; changed rows were not updated"
                    );
                }
                info!(
                    batch_id = %ctx.batch_id,
                    connection,
                    entity,
                    attempt,
                    strategy = policy.strategy.kind(),
                    processed = outcome.processed,
                    skipped = outcome.skipped,
                    mode = outcome.mode.map(|mode| mode.as_str()),
                    "Unit completed"
                );

                ctx.record_coverage(connection, entity);
                if policy.prune {
                    ctx.upstream_keys
                        .entry(entity.to_string())
                        .or_default()
                        .extend(outcome.source_keys);
                }
                Ok(UnitResult::Completed)
            }
            Err(err) if err.is_missing_relation() => {
                warn!(
                    batch_id = %ctx.batch_id,
                    connection,
                    entity,
                    error = %err,
                    "Source table missing on this connection, skipping unit"
                );
                self.ledger.mark_skipped(unit, &err.to_string()).await?;
                ctx.record_coverage(connection, entity);
                Ok(UnitResult::Completed)
            }
            Err(err) => {
                let reason = err.to_string();
                error!(
                    batch_id = %ctx.batch_id,
                    connection,
                    entity,
                    attempt,
                    error = %reason,
                    "Unit failed"
                );
                counter!("sync_unit_failed_total", "entity" => entity.to_string()).increment(1);
                self.ledger.mark_failed(unit, &reason).await?;
                Ok(UnitResult::Failed(reason))
            }
        }
    }

    /// One more attempt for each unit of `connection` still in `failed`.
    async fn final_retry(
        &self,
        ctx: &mut BatchContext,
        runner: &UnitRunner<'_>,
        connection: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<UnitFailure>> {
        let failed = self.ledger.failed_units(&ctx.batch_id, connection).await?;
        let failed: Vec<EntityPolicy> = failed
            .iter()
            .filter_map(|unit| ctx.policy(&unit.entity).cloned())
            .collect();
        if failed.is_empty() {
            return Ok(Vec::new());
        }

        info!(connection, units = failed.len(), "Final retry phase");
        let final_runner = runner.with_retry(self.final_retry);
        let mut still_failing = Vec::new();

        for policy in failed {
            if cancel.is_cancelled() {
                break;
            }
            if let UnitResult::Failed(reason) = self
                .run_unit(ctx, &final_runner, connection, &policy)
                .await?
            {
                error!(
                    batch_id = %ctx.batch_id,
                    connection,
                    entity = %policy.name,
                    error = %reason,
                    "Unit still failing after final retry, manual intervention required"
                );
                still_failing.push(UnitFailure {
                    connection: connection.to_string(),
                    entity: policy.name.clone(),
                    error: reason,
                });
            }
        }

        Ok(still_failing)
    }

    async fn prune(&self, ctx: &BatchContext) -> Vec<(String, u64)> {
        if ctx.options.is_connection_scoped() {
            return Vec::new();
        }

        let mut pruned = Vec::new();
        for policy in ctx.policies_in(SyncGroup::Full) {
            if !policy.prune {
                continue;
            }
            if !ctx.fully_covered(&policy.name) {
                info!(entity = %policy.name, "Not every connection synced this entity in this run, skipping prune");
                continue;
            }

            let keys = ctx.upstream_keys.get(&policy.name).cloned().unwrap_or_default();
            match self.pruner.prune(&self.db, &policy, &keys).await {
                Ok(deleted) => pruned.push((policy.name.clone(), deleted)),
                Err(err) => error!(entity = %policy.name, error = %err, "Pruning failed"),
            }
        }
        pruned
    }

    async fn advance_watermarks(&self, ctx: &BatchContext) -> Vec<String> {
        let mut advanced = Vec::new();
        for policy in &ctx.policies {
            if !matches!(policy.strategy, FetchStrategy::Incremental { .. }) {
                continue;
            }
            if !ctx.fully_covered(&policy.name) {
                info!(entity = %policy.name, "Incremental entity not fully synced, watermark unchanged");
                continue;
            }
            match self.watermarks.write(&policy.name, ctx.started_at).await {
                Ok(()) => advanced.push(policy.name.clone()),
                Err(err) => error!(entity = %policy.name, error = %err, "Failed to persist watermark"),
            }
        }
        advanced
    }
}
