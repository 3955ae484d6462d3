//! Dependency filter
//!
//! Drops rows whose required foreign keys do not resolve against parent rows
//! already present in the warehouse. Parent key sets are loaded once per unit.

use std::collections::HashSet;

use sea_orm::sea_query::{Alias, Query};
use sea_orm::{ConnectionTrait, FromQueryResult, JsonValue};
use tracing::debug;

use crate::error::SyncError;
use crate::policy::{Dependency, EntityPolicy, PolicyRegistry};
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::transform::{Row, key_component};

/// Locally synced key values of one parent entity.
#[derive(Debug, Clone, Default)]
pub struct ParentKeySet {
    normalized: HashSet<String>,
    values: Vec<JsonValue>,
}

impl ParentKeySet {
    pub fn from_values(values: impl IntoIterator<Item = JsonValue>) -> Self {
        let mut set = Self::default();
        for value in values {
            if let Some(component) = key_component(&value)
                && set.normalized.insert(component)
            {
                set.values.push(value);
            }
        }
        set
    }

    /// Load the distinct values of `column` from the warehouse table `table`.
    pub async fn load<C>(
        db: &C,
        table: &str,
        column: &str,
        retry: &RetryPolicy,
    ) -> Result<Self, SyncError>
    where
        C: ConnectionTrait,
    {
        let mut select = Query::select();
        select
            .distinct()
            .column(Alias::new(column))
            .from(Alias::new(table));
        let stmt = db.get_database_backend().build(&select);

        let label = format!("load parent keys {}.{}", table, column);
        let rows = execute_with_retry(retry, &label, || {
            let stmt = stmt.clone();
            async move { Ok(JsonValue::find_by_statement(stmt).all(db).await?) }
        })
        .await?;

        let set = Self::from_values(
            rows.into_iter()
                .filter_map(|mut row| row.get_mut(column).map(JsonValue::take)),
        );
        debug!(table, column, keys = set.len(), "Loaded parent key set");
        Ok(set)
    }

    pub fn contains(&self, value: &JsonValue) -> bool {
        key_component(value).is_some_and(|component| self.normalized.contains(&component))
    }

    /// Raw values, suitable for `IN (...)` filters.
    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Rows that passed every dependency check, plus the rejected count.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub rows: Vec<Row>,
    pub skipped: u64,
}

/// Declared dependencies of one entity, each paired with its parent key set.
#[derive(Debug, Default)]
pub struct DependencyFilter {
    checks: Vec<(Dependency, ParentKeySet)>,
}

impl DependencyFilter {
    pub fn new(checks: Vec<(Dependency, ParentKeySet)>) -> Self {
        Self { checks }
    }

    /// Load parent key sets for every dependency declared by `policy`.
    pub async fn load<C>(
        db: &C,
        policy: &EntityPolicy,
        registry: &PolicyRegistry,
        retry: &RetryPolicy,
    ) -> Result<Self, SyncError>
    where
        C: ConnectionTrait,
    {
        let mut checks = Vec::with_capacity(policy.dependencies.len());
        for dependency in &policy.dependencies {
            let (table, column) = parent_key_column(registry, &dependency.parent);
            let keys = ParentKeySet::load(db, &table, &column, retry).await?;
            checks.push((dependency.clone(), keys));
        }
        Ok(Self { checks })
    }

    /// True when a row satisfies every declared dependency.
    pub fn accepts(&self, row: &Row) -> bool {
        self.checks.iter().all(|(dependency, keys)| {
            match row.get(&dependency.foreign_key) {
                None | Some(JsonValue::Null) => dependency.optional,
                Some(value) => keys.contains(value),
            }
        })
    }

    pub fn filter(&self, rows: Vec<Row>) -> FilterOutcome {
        let mut outcome = FilterOutcome {
            rows: Vec::with_capacity(rows.len()),
            skipped: 0,
        };
        for row in rows {
            if self.accepts(&row) {
                outcome.rows.push(row);
            } else {
                outcome.skipped += 1;
            }
        }
        outcome
    }
}

/// Warehouse table and key column that identify rows of `parent`.
pub fn parent_key_column(registry: &PolicyRegistry, parent: &str) -> (String, String) {
    match registry.get(parent) {
        Some(policy) => (
            policy.destination_table.clone(),
            policy
                .key_columns
                .first()
                .map(|column| column.to_lowercase())
                .unwrap_or_else(|| format!("{}_id", policy.name)),
        ),
        None => (parent.to_string(), format!("{}_id", parent)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn dependency(parent: &str, foreign_key: &str, optional: bool) -> Dependency {
        Dependency {
            parent: parent.to_string(),
            foreign_key: foreign_key.to_string(),
            optional,
        }
    }

    #[test]
    fn test_required_dependency_rejects_unknown_and_null() {
        let filter = DependencyFilter::new(vec![(
            dependency("invoices", "invoice_id", false),
            ParentKeySet::from_values([json!(1), json!(2)]),
        )]);

        let outcome = filter.filter(vec![
            row(json!({"invoice_line_id": 1, "invoice_id": 1})),
            row(json!({"invoice_line_id": 2, "invoice_id": 3})),
            row(json!({"invoice_line_id": 3, "invoice_id": null})),
            row(json!({"invoice_line_id": 4, "invoice_id": "2"})),
        ]);

        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.skipped, 2);
    }

    #[test]
    fn test_optional_dependency_passes_null_but_not_dangling() {
        let filter = DependencyFilter::new(vec![
            (
                dependency("invoices", "invoice_id", false),
                ParentKeySet::from_values([json!(1)]),
            ),
            (
                dependency("products", "product_id", true),
                ParentKeySet::from_values([json!(100)]),
            ),
        ]);

        assert!(filter.accepts(&row(json!({"invoice_id": 1, "product_id": null}))));
        assert!(filter.accepts(&row(json!({"invoice_id": 1}))));
        assert!(filter.accepts(&row(json!({"invoice_id": 1, "product_id": 100.0}))));
        assert!(!filter.accepts(&row(json!({"invoice_id": 1, "product_id": 101}))));
        assert!(!filter.accepts(&row(json!({"invoice_id": 9, "product_id": 100}))));
    }

    #[test]
    fn test_key_set_deduplicates_equivalent_values() {
        let keys = ParentKeySet::from_values([json!(5), json!("5"), json!(null), json!(6)]);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&json!(5.0)));
    }

    #[test]
    fn test_parent_key_column_uses_first_key() {
        let registry = PolicyRegistry::builtin();
        assert_eq!(
            parent_key_column(&registry, "products"),
            ("products".to_string(), "product_id".to_string())
        );
    }
}
