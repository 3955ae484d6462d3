//! Table sync policy registry
//!
//! A single declarative registry describing, per entity type, how rows are
//! fetched from each branch, which parent entities must already exist locally,
//! and which columns form the key used for upsert matching. One generic engine
//! consumes it; there are no per-entity code paths.

use chrono::{Duration, NaiveDate};
use thiserror::Error;

/// Orchestration group. Groups run in declaration order so later groups may
/// depend on entities synced by earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncGroup {
    /// Master data owned by the canonical connection only
    SingleSource,
    /// Reference data fully replicated from every connection
    Full,
    /// Transactional data fetched through a filter
    Filtered,
}

/// Date window applied by the date-range strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateWindow {
    Fixed {
        start: NaiveDate,
        end: Option<NaiveDate>,
    },
    TrailingDays(i64),
}

impl DateWindow {
    /// Inclusive start and exclusive end for the given day.
    pub fn bounds(&self, today: NaiveDate) -> (NaiveDate, Option<NaiveDate>) {
        match self {
            DateWindow::Fixed { start, end } => (*start, *end),
            DateWindow::TrailingDays(days) => (today - Duration::days(*days), None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStrategy {
    Full,
    DateRange {
        column: String,
        window: DateWindow,
    },
    /// Fetch only rows whose `foreign_key` is among the locally synced keys of `parent`
    RelationshipFilter {
        foreign_key: String,
        parent: String,
    },
    /// Fetch rows created or updated after the persisted watermark
    Incremental {
        updated_column: String,
        created_column: Option<String>,
    },
    /// Safety net for unmapped entities
    FallbackLatestN {
        order_column: String,
        limit: u64,
    },
}

impl FetchStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchStrategy::Full => "full",
            FetchStrategy::DateRange { .. } => "date_range",
            FetchStrategy::RelationshipFilter { .. } => "relationship_filter",
            FetchStrategy::Incremental { .. } => "incremental",
            FetchStrategy::FallbackLatestN { .. } => "fallback_latest_n",
        }
    }
}

/// Foreign-key requirement on a parent entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub parent: String,
    pub foreign_key: String,
    pub optional: bool,
}

/// Policy entry for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPolicy {
    pub name: String,
    pub source_table: String,
    pub destination_table: String,
    pub group: SyncGroup,
    pub strategy: FetchStrategy,
    pub key_columns: Vec<String>,
    pub fillable: Vec<String>,
    pub timestamps: Vec<String>,
    pub dependencies: Vec<Dependency>,
    /// Remove destination rows no longer present upstream after a full pass
    pub prune: bool,
    /// No declared column set; every source column is written
    pub passthrough: bool,
}

impl EntityPolicy {
    pub fn new(name: &str, source_table: &str, group: SyncGroup, strategy: FetchStrategy) -> Self {
        Self {
            name: name.to_string(),
            source_table: source_table.to_string(),
            destination_table: name.to_string(),
            group,
            strategy,
            key_columns: Vec::new(),
            fillable: Vec::new(),
            timestamps: Vec::new(),
            dependencies: Vec::new(),
            prune: false,
            passthrough: false,
        }
    }

    /// Policy for an entity the registry does not know.
    pub fn fallback(name: &str, limit: u64) -> Self {
        let key = format!("{}_id", name);
        let mut policy = Self::new(
            name,
            name,
            SyncGroup::Filtered,
            FetchStrategy::FallbackLatestN {
                order_column: key.clone(),
                limit,
            },
        );
        policy.key_columns = vec![key];
        policy.passthrough = true;
        policy
    }

    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.key_columns = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn fillable(mut self, columns: &[&str]) -> Self {
        self.fillable = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn timestamps(mut self, columns: &[&str]) -> Self {
        self.timestamps = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn requires(mut self, parent: &str, foreign_key: &str) -> Self {
        self.dependencies.push(Dependency {
            parent: parent.to_string(),
            foreign_key: foreign_key.to_string(),
            optional: false,
        });
        self
    }

    pub fn optionally(mut self, parent: &str, foreign_key: &str) -> Self {
        self.dependencies.push(Dependency {
            parent: parent.to_string(),
            foreign_key: foreign_key.to_string(),
            optional: true,
        });
        self
    }

    pub fn pruned(mut self) -> Self {
        self.prune = true;
        self
    }

    /// Declared key, fillable, timestamp and foreign-key columns in that order,
    /// lower-cased and de-duplicated. Empty for pass-through policies.
    pub fn writable_columns(&self) -> Vec<String> {
        let mut columns: Vec<String> = Vec::new();
        let declared = self
            .key_columns
            .iter()
            .chain(self.fillable.iter())
            .chain(self.timestamps.iter())
            .chain(self.dependencies.iter().map(|dep| &dep.foreign_key));
        for column in declared {
            let column = column.to_lowercase();
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
        columns
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("entity '{entity}' declares no key columns")]
    MissingKey { entity: String },
    #[error("entity '{entity}' is registered more than once")]
    Duplicate { entity: String },
    #[error("entity '{entity}' depends on '{parent}', which is not registered before it")]
    UnorderedDependency { entity: String, parent: String },
    #[error("entity '{entity}' filters on column '{column}' that it does not declare")]
    UndeclaredFilterColumn { entity: String, column: String },
}

/// Ordered registry of entity policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    entries: Vec<EntityPolicy>,
}

impl PolicyRegistry {
    /// Build a registry from explicit entries, validating dependency order.
    pub fn new(mut entries: Vec<EntityPolicy>) -> Result<Self, PolicyError> {
        for entry in &mut entries {
            entry.name = entry.name.to_lowercase();
        }
        entries.sort_by_key(|entry| entry.group);
        let registry = Self { entries };
        registry.validate()?;
        Ok(registry)
    }

    /// The warehouse's built-in ERP policy.
    pub fn builtin() -> Self {
        Self::new(builtin_entries()).expect("built-in policy registry is consistent")
    }

    pub fn entries(&self) -> &[EntityPolicy] {
        &self.entries
    }

    /// Case-normalized lookup.
    pub fn get(&self, name: &str) -> Option<&EntityPolicy> {
        let name = name.trim().to_lowercase();
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Registered policy, or a fallback latest-N policy for unknown names.
    pub fn resolve(&self, name: &str, fallback_limit: u64) -> EntityPolicy {
        self.get(name)
            .cloned()
            .unwrap_or_else(|| EntityPolicy::fallback(&name.trim().to_lowercase(), fallback_limit))
    }

    /// Policies in scope for a run: all registered entities, or the requested
    /// subset in registry order followed by fallbacks for unknown names.
    pub fn select(&self, filter: Option<&[String]>, fallback_limit: u64) -> Vec<EntityPolicy> {
        let Some(filter) = filter.filter(|names| !names.is_empty()) else {
            return self.entries.clone();
        };

        let wanted: Vec<String> = filter.iter().map(|name| name.trim().to_lowercase()).collect();
        let mut selected: Vec<EntityPolicy> = self
            .entries
            .iter()
            .filter(|entry| wanted.contains(&entry.name))
            .cloned()
            .collect();

        for name in &wanted {
            if self.get(name).is_none() && !selected.iter().any(|entry| &entry.name == name) {
                selected.push(self.resolve(name, fallback_limit));
            }
        }

        selected
    }

    fn validate(&self) -> Result<(), PolicyError> {
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.key_columns.is_empty() {
                return Err(PolicyError::MissingKey {
                    entity: entry.name.clone(),
                });
            }

            let earlier = &self.entries[..index];
            if earlier.iter().any(|other| other.name == entry.name) {
                return Err(PolicyError::Duplicate {
                    entity: entry.name.clone(),
                });
            }

            let mut parents: Vec<&str> = entry
                .dependencies
                .iter()
                .map(|dep| dep.parent.as_str())
                .collect();
            if let FetchStrategy::RelationshipFilter { parent, .. } = &entry.strategy {
                parents.push(parent.as_str());
            }
            for parent in parents {
                if !earlier.iter().any(|other| other.name == parent) {
                    return Err(PolicyError::UnorderedDependency {
                        entity: entry.name.clone(),
                        parent: parent.to_string(),
                    });
                }
            }

            let filter_column = match &entry.strategy {
                FetchStrategy::DateRange { column, .. } => Some(column),
                FetchStrategy::RelationshipFilter { foreign_key, .. } => Some(foreign_key),
                FetchStrategy::Incremental { updated_column, .. } => Some(updated_column),
                _ => None,
            };
            if let Some(column) = filter_column
                && !entry.passthrough
                && !entry.writable_columns().contains(&column.to_lowercase())
            {
                return Err(PolicyError::UndeclaredFilterColumn {
                    entity: entry.name.clone(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_entries() -> Vec<EntityPolicy> {
    use FetchStrategy::*;

    let invoice_window = DateWindow::Fixed {
        start: NaiveDate::from_ymd_opt(2023, 1, 1).expect("valid date"),
        end: None,
    };

    vec![
        EntityPolicy::new("organizations", "ad_org", SyncGroup::SingleSource, Full)
            .keys(&["org_id"])
            .fillable(&["value", "name", "is_active"])
            .timestamps(&["created", "updated"]),
        EntityPolicy::new("product_categories", "m_product_category", SyncGroup::SingleSource, Full)
            .keys(&["category_id"])
            .fillable(&["value", "name", "is_active"])
            .timestamps(&["created", "updated"]),
        EntityPolicy::new("price_lists", "m_pricelist", SyncGroup::SingleSource, Full)
            .keys(&["price_list_id"])
            .fillable(&["name", "currency", "is_active"])
            .timestamps(&["created", "updated"]),
        EntityPolicy::new("products", "m_product", SyncGroup::Full, Full)
            .keys(&["product_id"])
            .fillable(&["value", "name", "uom", "is_active"])
            .timestamps(&["created", "updated"])
            .requires("product_categories", "category_id")
            .pruned(),
        EntityPolicy::new("locations", "m_locator", SyncGroup::Full, Full)
            .keys(&["location_id"])
            .fillable(&["value", "name"])
            .timestamps(&["created", "updated"])
            .requires("organizations", "org_id")
            .pruned(),
        EntityPolicy::new("business_partners", "c_bpartner", SyncGroup::Full, Full)
            .keys(&["partner_id"])
            .fillable(&["value", "name", "is_customer", "is_active"])
            .timestamps(&["created", "updated"])
            .pruned(),
        EntityPolicy::new("product_prices", "m_productprice", SyncGroup::Full, Full)
            .keys(&["price_list_id", "product_id"])
            .fillable(&["list_price", "standard_price"])
            .timestamps(&["updated"])
            .requires("price_lists", "price_list_id")
            .requires("products", "product_id")
            .pruned(),
        EntityPolicy::new(
            "invoices",
            "c_invoice",
            SyncGroup::Filtered,
            DateRange {
                column: "date_invoiced".to_string(),
                window: invoice_window,
            },
        )
        .keys(&["invoice_id"])
        .fillable(&["document_no", "date_invoiced", "grand_total", "doc_status", "is_sales"])
        .timestamps(&["created", "updated"])
        .requires("organizations", "org_id")
        .requires("business_partners", "partner_id"),
        EntityPolicy::new(
            "invoice_lines",
            "c_invoiceline",
            SyncGroup::Filtered,
            RelationshipFilter {
                foreign_key: "invoice_id".to_string(),
                parent: "invoices".to_string(),
            },
        )
        .keys(&["invoice_line_id"])
        .fillable(&["qty_invoiced", "line_net_amt"])
        .timestamps(&["created", "updated"])
        .requires("invoices", "invoice_id")
        .optionally("products", "product_id"),
        EntityPolicy::new(
            "orders",
            "c_order",
            SyncGroup::Filtered,
            DateRange {
                column: "date_ordered".to_string(),
                window: DateWindow::TrailingDays(365),
            },
        )
        .keys(&["order_id"])
        .fillable(&["document_no", "date_ordered", "grand_total", "doc_status"])
        .timestamps(&["created", "updated"])
        .requires("organizations", "org_id")
        .requires("business_partners", "partner_id"),
        EntityPolicy::new(
            "order_lines",
            "c_orderline",
            SyncGroup::Filtered,
            RelationshipFilter {
                foreign_key: "order_id".to_string(),
                parent: "orders".to_string(),
            },
        )
        .keys(&["order_line_id"])
        .fillable(&["qty_ordered", "line_net_amt"])
        .timestamps(&["created", "updated"])
        .requires("orders", "order_id")
        .optionally("products", "product_id"),
        EntityPolicy::new(
            "inventory",
            "m_storageonhand",
            SyncGroup::Filtered,
            Incremental {
                updated_column: "updated".to_string(),
                created_column: None,
            },
        )
        .keys(&["product_id", "location_id"])
        .fillable(&["qty_on_hand", "qty_reserved"])
        .timestamps(&["updated"])
        .requires("products", "product_id")
        .requires("locations", "location_id"),
        EntityPolicy::new(
            "allocations",
            "c_allocationline",
            SyncGroup::Filtered,
            Incremental {
                updated_column: "updated".to_string(),
                created_column: Some("created".to_string()),
            },
        )
        .keys(&["allocation_line_id"])
        .fillable(&["amount", "date_trx"])
        .timestamps(&["created", "updated"])
        .requires("business_partners", "partner_id")
        .optionally("invoices", "invoice_id"),
    ]
}
