//! Insert-or-upsert writer
//!
//! An empty destination is bulk-inserted with duplicates ignored, so several
//! branches racing on the same keys collapse to one row. A populated
//! destination is upserted on the entity's key columns. Both paths are chunked.
//!
//! Statements are rendered with inline literals: source values arrive as JSON
//! and the destination column type (date, numeric, timestamp) coerces them.

use std::collections::HashMap;

use async_trait::async_trait;
use metrics::counter;
use sea_orm::sea_query::{
    Alias, InsertStatement, MysqlQueryBuilder, OnConflict, PostgresQueryBuilder, Query,
    SimpleExpr, SqliteQueryBuilder,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::transform::{Row, RowKey, json_to_value};

/// How rows reach the destination for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Destination was empty: insert, ignoring duplicate keys
    Insert,
    /// Destination has rows: insert new keys, update existing ones
    Upsert,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Insert => "insert",
            WriteMode::Upsert => "upsert",
        }
    }
}

/// Decides the write mode for a unit.
#[async_trait]
pub trait WriteModeSelector: Send + Sync {
    async fn select(&self, db: &DatabaseConnection, table: &str) -> Result<WriteMode, SyncError>;
}

/// Insert when the destination table is empty, upsert otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectFromDestination;

#[async_trait]
impl WriteModeSelector for DetectFromDestination {
    async fn select(&self, db: &DatabaseConnection, table: &str) -> Result<WriteMode, SyncError> {
        let mut probe = Query::select();
        probe
            .expr(SimpleExpr::Value(1i32.into()))
            .from(Alias::new(table))
            .limit(1);
        let stmt = db.get_database_backend().build(&probe);

        Ok(match db.query_one(stmt).await? {
            Some(_) => WriteMode::Upsert,
            None => WriteMode::Insert,
        })
    }
}

/// Always the same mode.
#[derive(Debug, Clone, Copy)]
pub struct FixedWriteMode(pub WriteMode);

#[async_trait]
impl WriteModeSelector for FixedWriteMode {
    async fn select(&self, _db: &DatabaseConnection, _table: &str) -> Result<WriteMode, SyncError> {
        Ok(self.0)
    }
}

/// Result of writing one unit's rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub written: u64,
    pub mode: WriteMode,
    /// At least one chunk fell back to a target-less insert-ignore; changed
    /// rows in that chunk were not updated.
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
    IgnoreOnKeys,
    UpdateOnKeys,
    IgnoreAny,
}

/// Chunked writer over the warehouse connection.
pub struct TableWriter<'a> {
    db: &'a DatabaseConnection,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl<'a> TableWriter<'a> {
    pub fn new(db: &'a DatabaseConnection, chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            db,
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    pub async fn write(
        &self,
        table: &str,
        key_columns: &[String],
        rows: &[Row],
        mode: WriteMode,
    ) -> Result<WriteReport, SyncError> {
        let mut report = WriteReport {
            written: 0,
            mode,
            degraded: false,
        };
        if rows.is_empty() {
            return Ok(report);
        }

        let rows = dedupe_by_key(key_columns, rows);
        let columns = column_union(key_columns, &rows);
        for chunk in rows.chunks(self.chunk_size) {
            let degraded = self
                .write_chunk(table, key_columns, &columns, chunk, mode)
                .await?;
            if degraded {
                counter!("sync_degraded_write_total", "table" => table.to_string()).increment(1);
                report.degraded = true;
            }
            report.written += chunk.len() as u64;
        }

        debug!(
            table,
            rows = report.written,
            mode = mode.as_str(),
            degraded = report.degraded,
            "Wrote rows"
        );
        Ok(report)
    }

    /// Returns true when the chunk went through the degraded path.
    async fn write_chunk(
        &self,
        table: &str,
        key_columns: &[String],
        columns: &[String],
        chunk: &[Row],
        mode: WriteMode,
    ) -> Result<bool, SyncError> {
        if mode == WriteMode::Insert {
            match self
                .execute(table, key_columns, columns, chunk, Conflict::IgnoreOnKeys)
                .await
            {
                Ok(()) => return Ok(false),
                Err(err) if err.is_missing_conflict_target() => {
                    debug!(table, error = %err, "Insert-ignore has no conflict target, upserting chunk");
                }
                Err(err) => return Err(err),
            }
        }

        match self
            .execute(table, key_columns, columns, chunk, Conflict::UpdateOnKeys)
            .await
        {
            Ok(()) => Ok(false),
            Err(err) if err.is_missing_conflict_target() => {
                warn!(
                    table,
                    keys = %key_columns.join(","),
                    error = %err,
                    "No unique constraint for upsert; falling back to insert-ignore, changed rows will not be updated"
                );
                self.execute(table, key_columns, columns, chunk, Conflict::IgnoreAny)
                    .await?;
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    async fn execute(
        &self,
        table: &str,
        key_columns: &[String],
        columns: &[String],
        chunk: &[Row],
        conflict: Conflict,
    ) -> Result<(), SyncError> {
        let backend = self.db.get_database_backend();
        let insert = insert_statement(table, key_columns, columns, chunk, conflict)?;
        let sql = render(backend, &insert);
        let label = format!("write {}", table);

        execute_with_retry(&self.retry, &label, || {
            let stmt = Statement::from_string(backend, sql.clone());
            async move {
                self.db.execute(stmt).await?;
                Ok(())
            }
        })
        .await
    }
}

/// One row per key, the last occurrence winning, in first-seen key order.
///
/// A single upsert statement may not touch the same key twice on Postgres.
fn dedupe_by_key(key_columns: &[String], rows: &[Row]) -> Vec<Row> {
    let mut positions: HashMap<RowKey, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        match RowKey::extract(row, key_columns) {
            Some(key) => match positions.get(&key) {
                Some(&index) => unique[index] = row.clone(),
                None => {
                    positions.insert(key, unique.len());
                    unique.push(row.clone());
                }
            },
            None => unique.push(row.clone()),
        }
    }
    if unique.len() < rows.len() {
        debug!(collapsed = rows.len() - unique.len(), "Collapsed rows sharing a key");
    }
    unique
}

/// Key columns first, then every other column seen in `rows` in first-seen order.
fn column_union(key_columns: &[String], rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = key_columns.to_vec();
    for row in rows {
        for column in row.keys() {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
    }
    columns
}

fn insert_statement(
    table: &str,
    key_columns: &[String],
    columns: &[String],
    chunk: &[Row],
    conflict: Conflict,
) -> Result<InsertStatement, SyncError> {
    let mut insert = Query::insert();
    insert
        .into_table(Alias::new(table))
        .columns(columns.iter().map(Alias::new));

    for row in chunk {
        let values: Vec<SimpleExpr> = columns
            .iter()
            .map(|column| json_to_value(row.get(column).unwrap_or(&JsonValue::Null)).into())
            .collect();
        insert.values(values).map_err(|err| SyncError::InvalidRow {
            entity: table.to_string(),
            details: err.to_string(),
        })?;
    }

    let keys = key_columns.iter().map(Alias::new);
    let on_conflict = match conflict {
        Conflict::IgnoreOnKeys => OnConflict::columns(keys).do_nothing().to_owned(),
        Conflict::UpdateOnKeys => {
            let updates: Vec<Alias> = columns
                .iter()
                .filter(|column| !key_columns.contains(column))
                .map(Alias::new)
                .collect();
            if updates.is_empty() {
                OnConflict::columns(keys).do_nothing().to_owned()
            } else {
                OnConflict::columns(keys).update_columns(updates).to_owned()
            }
        }
        Conflict::IgnoreAny => OnConflict::new().do_nothing().to_owned(),
    };
    insert.on_conflict(on_conflict);

    Ok(insert)
}

fn render(backend: DatabaseBackend, insert: &InsertStatement) -> String {
    match backend {
        DatabaseBackend::Postgres => insert.to_string(PostgresQueryBuilder),
        DatabaseBackend::Sqlite => insert.to_string(SqliteQueryBuilder),
        DatabaseBackend::MySql => insert.to_string(MysqlQueryBuilder),
    }
}
