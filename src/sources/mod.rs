//! Branch database access: the Connection Registry and its readers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::sea_query::{Alias, Asterisk, Cond, Expr, Order, Query, SelectStatement};
use sea_orm::{ConnectionTrait, DatabaseConnection, FromQueryResult, JsonValue};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::db;
use crate::error::SyncError;
use crate::transform::json_to_value;

/// Row filter pushed down to the source query.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchFilter {
    All,
    /// `start <= column < end`
    DateRange {
        column: String,
        start: NaiveDate,
        end: Option<NaiveDate>,
    },
    KeyIn {
        column: String,
        keys: Vec<JsonValue>,
    },
    /// Rows updated (or created) strictly after `since`; all rows when `since` is unset.
    ChangedSince {
        updated_column: String,
        created_column: Option<String>,
        since: Option<DateTime<Utc>>,
    },
    /// Newest `limit` rows by `order_column` descending.
    LatestN { order_column: String, limit: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub table: String,
    pub filter: FetchFilter,
}

impl FetchRequest {
    pub fn new(table: impl Into<String>, filter: FetchFilter) -> Self {
        Self {
            table: table.into(),
            filter,
        }
    }

    /// Build the `SELECT *` statement for this request.
    pub fn to_select(&self) -> SelectStatement {
        let mut select = Query::select();
        select.column(Asterisk).from(Alias::new(&self.table));

        match &self.filter {
            FetchFilter::All => {}
            FetchFilter::DateRange { column, start, end } => {
                select.and_where(Expr::col(Alias::new(column)).gte(*start));
                if let Some(end) = end {
                    select.and_where(Expr::col(Alias::new(column)).lt(*end));
                }
            }
            FetchFilter::KeyIn { column, keys } => {
                select.and_where(
                    Expr::col(Alias::new(column)).is_in(keys.iter().map(json_to_value)),
                );
            }
            FetchFilter::ChangedSince {
                updated_column,
                created_column,
                since,
            } => {
                if let Some(since) = since {
                    let mut cond = Cond::any().add(Expr::col(Alias::new(updated_column)).gt(*since));
                    if let Some(created) = created_column {
                        cond = cond.add(Expr::col(Alias::new(created)).gt(*since));
                    }
                    select.cond_where(cond);
                }
            }
            FetchFilter::LatestN {
                order_column,
                limit,
            } => {
                select
                    .order_by(Alias::new(order_column), Order::Desc)
                    .limit(*limit);
            }
        }

        select
    }
}

/// A named branch that rows can be read from.
#[async_trait]
pub trait SourceReader: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch raw rows as JSON objects.
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<JsonValue>, SyncError>;

    /// Round-trip check used by the `check` command.
    async fn ping(&self) -> Result<(), SyncError>;
}

/// SeaORM-backed branch connection, opened on first use.
pub struct DatabaseSource {
    name: String,
    url: Option<String>,
    acquire_timeout_ms: u64,
    conn: OnceCell<DatabaseConnection>,
}

impl DatabaseSource {
    pub fn lazy(name: impl Into<String>, url: impl Into<String>, acquire_timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            url: Some(url.into()),
            acquire_timeout_ms,
            conn: OnceCell::new(),
        }
    }

    /// Wrap an already open connection.
    pub fn from_connection(name: impl Into<String>, conn: DatabaseConnection) -> Self {
        Self {
            name: name.into(),
            url: None,
            acquire_timeout_ms: 0,
            conn: OnceCell::new_with(Some(conn)),
        }
    }

    async fn connection(&self) -> Result<&DatabaseConnection, SyncError> {
        self.conn
            .get_or_try_init(|| async {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| SyncError::UnknownConnection(self.name.clone()))?;
                info!(connection = %self.name, "Opening source connection");
                db::connect_source(url, self.acquire_timeout_ms)
                    .await
                    .map_err(|err| SyncError::remote(&self.name, err))
            })
            .await
    }
}

#[async_trait]
impl SourceReader for DatabaseSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<JsonValue>, SyncError> {
        let conn = self.connection().await?;
        let stmt = conn.get_database_backend().build(&request.to_select());
        debug!(connection = %self.name, sql = %stmt.sql, "Fetching source rows");

        JsonValue::find_by_statement(stmt)
            .all(conn)
            .await
            .map_err(|err| SyncError::remote(&self.name, err))
    }

    async fn ping(&self) -> Result<(), SyncError> {
        let conn = self.connection().await?;
        conn.ping()
            .await
            .map_err(|err| SyncError::remote(&self.name, err))
    }
}

/// Ordered set of branch readers.
#[derive(Clone)]
pub struct SourceRegistry {
    order: Vec<String>,
    readers: HashMap<String, Arc<dyn SourceReader>>,
    canonical: Option<String>,
}

impl SourceRegistry {
    /// Registry over `readers` in the given order. `canonical` defaults to the first reader.
    pub fn new(
        readers: Vec<Arc<dyn SourceReader>>,
        canonical: Option<&str>,
    ) -> Result<Self, SyncError> {
        let mut order = Vec::with_capacity(readers.len());
        let mut by_name = HashMap::with_capacity(readers.len());
        for reader in readers {
            let name = reader.name().to_string();
            if by_name.insert(name.clone(), reader).is_none() {
                order.push(name);
            }
        }

        let canonical = match canonical {
            Some(name) if !by_name.contains_key(name) => {
                return Err(SyncError::UnknownConnection(name.to_string()));
            }
            Some(name) => Some(name.to_string()),
            None => order.first().cloned(),
        };

        Ok(Self {
            order,
            readers: by_name,
            canonical,
        })
    }

    /// Lazy database sources for every configured branch.
    pub fn from_config(config: &AppConfig) -> Result<Self, SyncError> {
        let readers = config
            .sources
            .iter()
            .map(|source| {
                Arc::new(DatabaseSource::lazy(
                    &source.name,
                    &source.url,
                    config.db_acquire_timeout_ms,
                )) as Arc<dyn SourceReader>
            })
            .collect();
        Self::new(readers, config.canonical_source())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SourceReader>, SyncError> {
        self.readers
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownConnection(name.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn canonical(&self) -> Option<&str> {
        self.canonical.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
