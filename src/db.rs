//! Connection management for the warehouse database and branch sources.
//!
//! The warehouse pool is created eagerly at startup with a short retry loop.
//! Branch connections are opened lazily by [`crate::sources`] through
//! [`connect_source`] so that an unreachable branch only fails its own units.

use anyhow::{Context, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Failed to connect to database after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: DbErr,
    },
    #[error("Invalid database configuration: {message}")]
    InvalidConfiguration { message: String },
}

const CONNECT_ATTEMPTS: u32 = 5;

fn connect_options(url: &str, max_connections: u32, acquire_timeout_ms: u64) -> ConnectOptions {
    let mut opt = ConnectOptions::new(url);
    opt.max_connections(max_connections)
        .acquire_timeout(Duration::from_millis(acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);
    opt
}

/// Initializes the warehouse connection pool.
///
/// Retries the initial connect with exponential backoff before giving up.
///
/// ```no_run
/// use branch_sync::{config::ConfigLoader, db::init_pool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ConfigLoader::new().load()?;
///     let db = init_pool(&config).await?;
///     Ok(())
/// }
/// ```
pub async fn init_pool(cfg: &AppConfig) -> Result<DatabaseConnection> {
    if cfg.database_url.is_empty() {
        return Err(DatabaseError::InvalidConfiguration {
            message: "Database URL cannot be empty".to_string(),
        }
        .into());
    }

    let opt = connect_options(
        &cfg.database_url,
        cfg.db_max_connections,
        cfg.db_acquire_timeout_ms,
    );

    let mut attempt = 1;
    let mut retry_delay = Duration::from_millis(100);

    loop {
        match Database::connect(opt.clone()).await {
            Ok(conn) => {
                log::info!("Connected to warehouse database (attempt {})", attempt);
                return Ok(conn);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                log::warn!(
                    "Warehouse connection attempt {} failed: {}, retrying in {:?}",
                    attempt,
                    e,
                    retry_delay
                );
                sleep(retry_delay).await;
                retry_delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                log::error!(
                    "Failed to connect to warehouse database after {} attempts: {}",
                    attempt,
                    e
                );
                return Err(DatabaseError::RetriesExhausted {
                    attempts: attempt,
                    source: e,
                }
                .into());
            }
        }
    }
}

/// Open a connection to a branch database.
///
/// Branch reads are sequential, so the pool is kept small. A single attempt is
/// made here; retrying is the caller's responsibility.
pub async fn connect_source(url: &str, acquire_timeout_ms: u64) -> Result<DatabaseConnection, DbErr> {
    Database::connect(connect_options(url, 1, acquire_timeout_ms)).await
}

/// Run `SELECT 1` against a connection.
pub async fn health_check(db: &DatabaseConnection) -> Result<()> {
    let stmt = Statement::from_string(db.get_database_backend(), "SELECT 1".to_string());

    db.query_one(stmt)
        .await
        .context("Database health check failed")?;

    Ok(())
}
