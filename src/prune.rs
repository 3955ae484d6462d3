//! Removal of warehouse rows that no longer exist in any branch.

use std::collections::HashSet;

use async_trait::async_trait;
use sea_orm::sea_query::{Alias, Cond, Expr, Query};
use sea_orm::{ConnectionTrait, DatabaseConnection, FromQueryResult, JsonValue};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::policy::EntityPolicy;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::transform::{Row, RowKey, json_to_value, normalize_row};

#[async_trait]
pub trait Pruner: Send + Sync {
    /// Delete destination rows of `policy` whose key is absent from `valid_keys`.
    /// Returns the number of deleted rows.
    async fn prune(
        &self,
        db: &DatabaseConnection,
        policy: &EntityPolicy,
        valid_keys: &HashSet<RowKey>,
    ) -> Result<u64, SyncError>;
}

/// Diffs destination keys against the reconciled key set and deletes the rest
/// in chunks.
pub struct KeyPruner {
    chunk_size: usize,
    retry: RetryPolicy,
}

impl KeyPruner {
    pub fn new(chunk_size: usize, retry: RetryPolicy) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    async fn destination_keys(
        &self,
        db: &DatabaseConnection,
        table: &str,
        key_columns: &[String],
    ) -> Result<Vec<Row>, SyncError> {
        let mut select = Query::select();
        select
            .columns(key_columns.iter().map(Alias::new))
            .from(Alias::new(table));
        let stmt = db.get_database_backend().build(&select);

        let rows = execute_with_retry(&self.retry, &format!("read keys {}", table), || {
            let stmt = stmt.clone();
            async move { Ok(JsonValue::find_by_statement(stmt).all(db).await?) }
        })
        .await?;

        rows.into_iter().map(|row| normalize_row(table, row)).collect()
    }
}

#[async_trait]
impl Pruner for KeyPruner {
    async fn prune(
        &self,
        db: &DatabaseConnection,
        policy: &EntityPolicy,
        valid_keys: &HashSet<RowKey>,
    ) -> Result<u64, SyncError> {
        let table = policy.destination_table.as_str();
        let key_columns: Vec<String> = policy
            .key_columns
            .iter()
            .map(|column| column.to_lowercase())
            .collect();

        if valid_keys.is_empty() {
            warn!(entity = %policy.name, "No upstream keys collected, refusing to prune");
            return Ok(0);
        }

        let stale: Vec<Row> = self
            .destination_keys(db, table, &key_columns)
            .await?
            .into_iter()
            .filter(|row| {
                RowKey::extract(row, &key_columns).is_some_and(|key| !valid_keys.contains(&key))
            })
            .collect();

        let mut deleted = 0;
        for chunk in stale.chunks(self.chunk_size) {
            let mut cond = Cond::any();
            for row in chunk {
                let mut matches = Cond::all();
                for column in &key_columns {
                    let value = row.get(column).unwrap_or(&JsonValue::Null);
                    matches = matches.add(Expr::col(Alias::new(column)).eq(json_to_value(value)));
                }
                cond = cond.add(matches);
            }

            let mut delete = Query::delete();
            delete.from_table(Alias::new(table)).cond_where(cond);
            let stmt = db.get_database_backend().build(&delete);

            let result = execute_with_retry(&self.retry, &format!("prune {}", table), || {
                let stmt = stmt.clone();
                async move { Ok(db.execute(stmt).await?) }
            })
            .await?;
            deleted += result.rows_affected();
        }

        info!(entity = %policy.name, deleted, "Pruned rows missing upstream");
        Ok(deleted)
    }
}
