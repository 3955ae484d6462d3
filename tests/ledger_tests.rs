#[path = "test_utils/mod.rs"]
mod test_utils;

use anyhow::Result;
use branch_sync::error::SyncError;
use branch_sync::ledger::{ERROR_PREVIEW_CHARS, ProgressLedger, UnitStatus};
use serde_json::json;
use test_utils::setup_test_db;

#[tokio::test]
async fn test_create_and_load_batch() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);

    let batch = ledger
        .create_batch(json!({"connections": [], "entities": ["orders"], "skip_phase1": false}))
        .await?;
    assert_eq!(batch.status, "running");
    assert_eq!(batch.total_tables, 0);

    let loaded = ledger.load_batch(&batch.id).await?;
    assert_eq!(loaded.id, batch.id);
    assert_eq!(loaded.options, Some(json!({"connections": [], "entities": ["orders"], "skip_phase1": false})));
    Ok(())
}

#[tokio::test]
async fn test_unknown_batch_is_not_found() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);

    let err = ledger.load_batch("19990101_000000_zzzzzz").await.unwrap_err();
    assert!(matches!(err, SyncError::BatchNotFound(id) if id == "19990101_000000_zzzzzz"));
    Ok(())
}

#[tokio::test]
async fn test_register_unit_is_idempotent_and_grows_total() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    let first = ledger.register_unit(&batch.id, "branch_a", "products").await?;
    let again = ledger.register_unit(&batch.id, "branch_a", "products").await?;
    assert_eq!(first.id, again.id);
    assert_eq!(first.status, UnitStatus::Pending.as_str());

    ledger.register_unit(&batch.id, "branch_b", "products").await?;
    let batch = ledger.load_batch(&batch.id).await?;
    assert_eq!(batch.total_tables, 2);
    Ok(())
}

#[tokio::test]
async fn test_unit_lifecycle_updates_counts() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    let ok = ledger.register_unit(&batch.id, "branch_a", "orders").await?;
    let ok = ledger.mark_started(ok).await?;
    assert_eq!(ok.status, "in_progress");
    assert!(ok.started_at.is_some());
    let ok = ledger.mark_completed(ok, 90, 10, false).await?;
    assert_eq!(ok.status, "completed");
    assert_eq!(ok.records_processed, 90);
    assert_eq!(ok.records_skipped, 10);
    assert!(ok.duration_ms.is_some());

    let bad = ledger.register_unit(&batch.id, "branch_b", "orders").await?;
    let bad = ledger.mark_started(bad).await?;
    let bad = ledger
        .mark_failed(bad, "source 'branch_b' failed: permission denied for table c_order")
        .await?;
    assert_eq!(bad.status, "failed");
    assert!(bad.error_message.unwrap().contains("permission denied"));

    let degraded = ledger.register_unit(&batch.id, "branch_c", "orders").await?;
    let degraded = ledger.mark_started(degraded).await?;
    ledger.mark_completed(degraded, 5, 0, true).await?;

    let batch = ledger.load_batch(&batch.id).await?;
    assert_eq!(batch.total_tables, 3);
    assert_eq!(batch.completed_tables, 2);
    assert_eq!(batch.failed_tables, 1);
    assert_eq!(batch.degraded_tables, 1);
    assert!(batch.completed_tables + batch.failed_tables <= batch.total_tables);
    Ok(())
}

#[tokio::test]
async fn test_completed_unit_is_never_reopened() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    let unit = ledger.register_unit(&batch.id, "branch_a", "products").await?;
    let unit = ledger.mark_started(unit).await?;
    let unit = ledger.mark_completed(unit, 3, 0, false).await?;

    let unchanged = ledger.mark_started(unit.clone()).await?;
    assert_eq!(unchanged.status, "completed");
    let unchanged = ledger.mark_failed(unchanged, "late failure").await?;
    assert_eq!(unchanged.status, "completed");
    assert_eq!(unchanged.records_processed, 3);
    Ok(())
}

#[tokio::test]
async fn test_failed_unit_retry_counts_attempts() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    let unit = ledger.register_unit(&batch.id, "branch_a", "invoices").await?;
    let unit = ledger.mark_started(unit).await?;
    let unit = ledger.mark_failed(unit, "connection timed out").await?;
    let unit = ledger.mark_started(unit).await?;
    assert_eq!(unit.status, "in_progress");
    assert_eq!(unit.retry_count, 1);

    let unit = ledger.mark_completed(unit, 1, 0, false).await?;
    assert_eq!(unit.error_message, None);

    let batch = ledger.load_batch(&batch.id).await?;
    assert_eq!(batch.failed_tables, 0);
    assert_eq!(batch.completed_tables, 1);
    Ok(())
}

#[tokio::test]
async fn test_should_skip_only_completed_units() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    assert!(!ledger.should_skip(&batch.id, "branch_a", "products").await?);

    let done = ledger.register_unit(&batch.id, "branch_a", "products").await?;
    let done = ledger.mark_started(done).await?;
    ledger.mark_completed(done, 1, 0, false).await?;

    let failed = ledger.register_unit(&batch.id, "branch_b", "products").await?;
    let failed = ledger.mark_started(failed).await?;
    ledger.mark_failed(failed, "boom").await?;

    assert!(ledger.should_skip(&batch.id, "branch_a", "products").await?);
    assert!(!ledger.should_skip(&batch.id, "branch_b", "products").await?);

    let other = ledger.create_batch(json!({})).await?;
    assert!(!ledger.should_skip(&other.id, "branch_a", "products").await?);
    Ok(())
}

#[tokio::test]
async fn test_summary_and_truncated_details() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    let unit = ledger.register_unit(&batch.id, "branch_a", "orders").await?;
    let unit = ledger.mark_started(unit).await?;
    ledger.mark_completed(unit, 7, 2, false).await?;

    let unit = ledger.register_unit(&batch.id, "branch_b", "orders").await?;
    let unit = ledger.mark_started(unit).await?;
    ledger.mark_failed(unit, &"x".repeat(500)).await?;

    ledger.register_unit(&batch.id, "branch_c", "orders").await?;

    let summary = ledger.summary(&batch.id).await?;
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.records_processed, 7);
    assert_eq!(summary.records_skipped, 2);

    let details = ledger.unit_details(&batch.id).await?;
    assert_eq!(details.len(), 3);
    let failed = details.iter().find(|d| d.connection == "branch_b").unwrap();
    let error = failed.error.as_deref().unwrap();
    assert_eq!(error.chars().count(), ERROR_PREVIEW_CHARS + 3);
    assert!(error.ends_with("..."));
    Ok(())
}

#[tokio::test]
async fn test_complete_interrupt_and_resume() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);
    let batch = ledger.create_batch(json!({})).await?;

    let interrupted = ledger.mark_interrupted(&batch.id).await?;
    assert_eq!(interrupted.status, "interrupted");

    let resumed = ledger.resume_batch(&batch.id).await?;
    assert_eq!(resumed.status, "running");
    assert_eq!(resumed.completed_at, None);

    let completed = ledger.complete_batch(&batch.id).await?;
    assert_eq!(completed.status, "completed");
    assert!(completed.completed_at.is_some());
    assert!(completed.duration_ms.unwrap() >= 0);
    Ok(())
}

#[tokio::test]
async fn test_list_batches_newest_first() -> Result<()> {
    let db = setup_test_db().await?;
    let ledger = ProgressLedger::new(db);

    let first = ledger.create_batch(json!({})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = ledger.create_batch(json!({})).await?;

    let listed = ledger.list_batches(10).await?;
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);

    assert_eq!(ledger.list_batches(1).await?.len(), 1);
    assert_eq!(ledger.batch_count().await?, 2);
    Ok(())
}
