//! Test utilities for database testing.
//!
//! The warehouse is an in-memory SQLite database with all migrations applied.
//! Each branch is a separate in-memory SQLite database carrying the ERP source
//! tables, wrapped in a `DatabaseSource`.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use branch_sync::config::SyncSettings;
use branch_sync::error::SyncError;
use branch_sync::retry::RetryPolicy;
use branch_sync::sources::{DatabaseSource, FetchRequest, SourceReader};
use branch_sync::transform::json_to_value;
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::{Alias, Query, SimpleExpr};
use sea_orm::{
    ConnectionTrait, Database, DatabaseConnection, FromQueryResult, JsonValue, Statement,
};

/// ERP source tables and their columns. `ad_client_id` is an ERP column with no
/// warehouse counterpart.
const ERP_TABLES: &[(&str, &[&str])] = &[
    ("ad_org", &["org_id", "value", "name", "is_active", "created", "updated", "ad_client_id"]),
    ("m_product_category", &["category_id", "value", "name", "is_active", "created", "updated"]),
    ("m_pricelist", &["price_list_id", "name", "currency", "is_active", "created", "updated"]),
    (
        "m_product",
        &["product_id", "value", "name", "category_id", "uom", "is_active", "created", "updated", "ad_client_id"],
    ),
    ("m_locator", &["location_id", "org_id", "value", "name", "created", "updated"]),
    (
        "c_bpartner",
        &["partner_id", "value", "name", "is_customer", "is_active", "created", "updated"],
    ),
    ("m_productprice", &["price_list_id", "product_id", "list_price", "standard_price", "updated"]),
    (
        "c_invoice",
        &[
            "invoice_id", "org_id", "partner_id", "document_no", "date_invoiced", "grand_total",
            "doc_status", "is_sales", "created", "updated",
        ],
    ),
    (
        "c_invoiceline",
        &["invoice_line_id", "invoice_id", "product_id", "qty_invoiced", "line_net_amt", "created", "updated"],
    ),
    (
        "c_order",
        &[
            "order_id", "org_id", "partner_id", "document_no", "date_ordered", "grand_total",
            "doc_status", "created", "updated",
        ],
    ),
    (
        "c_orderline",
        &["order_line_id", "order_id", "product_id", "qty_ordered", "line_net_amt", "created", "updated"],
    ),
    ("m_storageonhand", &["product_id", "location_id", "qty_on_hand", "qty_reserved", "updated"]),
    (
        "c_allocationline",
        &["allocation_line_id", "invoice_id", "partner_id", "amount", "date_trx", "created", "updated"],
    ),
];

const AMOUNT_COLUMNS: &[&str] = &[
    "grand_total",
    "line_net_amt",
    "list_price",
    "standard_price",
    "amount",
];

fn column_type(column: &str) -> &'static str {
    if column.ends_with("_id") || column.starts_with("qty_") {
        "INTEGER"
    } else if AMOUNT_COLUMNS.contains(&column) {
        "REAL"
    } else {
        "TEXT"
    }
}

/// Sets up an in-memory SQLite warehouse with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Sets up an in-memory SQLite branch database with every ERP source table.
pub async fn setup_source_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    for (table, columns) in ERP_TABLES {
        let columns: Vec<String> = columns
            .iter()
            .map(|column| format!("{} {}", column, column_type(column)))
            .collect();
        execute(&db, &format!("CREATE TABLE {} ({})", table, columns.join(", "))).await?;
    }
    Ok(db)
}

pub async fn execute(db: &DatabaseConnection, sql: &str) -> Result<()> {
    db.execute(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?;
    Ok(())
}

/// Insert JSON objects into `table`, one statement per row.
pub async fn insert_rows(db: &DatabaseConnection, table: &str, rows: &[JsonValue]) -> Result<()> {
    for row in rows {
        let object = row
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("fixture rows must be objects"))?;
        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(table))
            .columns(object.keys().map(Alias::new))
            .values(
                object
                    .values()
                    .map(|value| SimpleExpr::from(json_to_value(value)))
                    .collect::<Vec<_>>(),
            )?;
        db.execute(db.get_database_backend().build(&insert)).await?;
    }
    Ok(())
}

pub async fn count_rows(db: &DatabaseConnection, table: &str) -> Result<i64> {
    scalar_i64(db, &format!("SELECT COUNT(*) AS value FROM {}", table)).await
}

/// First column of the first row, aliased `value`, as an integer.
pub async fn scalar_i64(db: &DatabaseConnection, sql: &str) -> Result<i64> {
    let row = db
        .query_one(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("query returned no rows: {}", sql))?;
    Ok(row.try_get::<i64>("", "value")?)
}

/// First column of the first row, aliased `value`, as a float.
pub async fn scalar_f64(db: &DatabaseConnection, sql: &str) -> Result<f64> {
    let row = db
        .query_one(Statement::from_string(db.get_database_backend(), sql.to_string()))
        .await?
        .ok_or_else(|| anyhow::anyhow!("query returned no rows: {}", sql))?;
    Ok(row.try_get::<f64>("", "value")?)
}

pub async fn query_one(db: &DatabaseConnection, sql: &str) -> Result<JsonValue> {
    JsonValue::find_by_statement(Statement::from_string(
        db.get_database_backend(),
        sql.to_string(),
    ))
    .one(db)
    .await?
    .ok_or_else(|| anyhow::anyhow!("query returned no rows: {}", sql))
}

pub async fn query_all(db: &DatabaseConnection, sql: &str) -> Result<Vec<JsonValue>> {
    Ok(JsonValue::find_by_statement(Statement::from_string(
        db.get_database_backend(),
        sql.to_string(),
    ))
    .all(db)
    .await?)
}

pub fn database_source(name: &str, db: DatabaseConnection) -> Arc<dyn SourceReader> {
    Arc::new(DatabaseSource::from_connection(name, db))
}

/// Settings for tests: no retry delay, watermarks under `dir`.
pub fn test_settings(dir: &Path) -> SyncSettings {
    SyncSettings {
        retry_delay_seconds: 0,
        watermark_dir: dir.to_path_buf(),
        ..SyncSettings::default()
    }
}

pub fn instant_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO)
}

/// Source wrapper that fails its first `failures` fetches with `message`, then
/// delegates to the wrapped reader. Counts every fetch call.
pub struct FlakySource {
    inner: Arc<dyn SourceReader>,
    failures: AtomicU32,
    message: String,
    calls: AtomicU32,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn SourceReader>, failures: u32, message: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures: AtomicU32::new(failures),
            message: message.to_string(),
            calls: AtomicU32::new(0),
        })
    }

    /// Wrapper that never fails; only counts calls.
    pub fn counting(inner: Arc<dyn SourceReader>) -> Arc<Self> {
        Self::new(inner, 0, "")
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceReader for FlakySource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<JsonValue>, SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Remote {
                connection: self.name().to_string(),
                code: None,
                message: self.message.clone(),
            });
        }
        self.inner.fetch(request).await
    }

    async fn ping(&self) -> Result<(), SyncError> {
        self.inner.ping().await
    }
}
