//! # Error Handling
//!
//! Unified error type for the synchronization engine. Errors carry enough
//! structure (`code` plus `message`) for the retry layer to classify them without
//! knowing which database client produced them.

use std::sync::OnceLock;

use regex::RegexSet;
use sea_orm::{DbErr, RuntimeErr};
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised by the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    /// Failure reported while talking to a branch connection
    #[error("source '{connection}' failed: {message}")]
    Remote {
        connection: String,
        code: Option<String>,
        message: String,
    },

    #[error("batch '{0}' not found")]
    BatchNotFound(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("unknown source connection '{0}'")]
    UnknownConnection(String),

    #[error("no source connections are configured")]
    NoConnections,

    #[error("watermark for '{entity}' could not be accessed: {source}")]
    Watermark {
        entity: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid row for '{entity}': {details}")]
    InvalidRow { entity: String, details: String },

    #[error("failed to serialize batch options: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structured view of a failure, independent of the client error hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub code: Option<String>,
    pub message: String,
}

impl SyncError {
    /// Wrap a database error raised by a source connection.
    pub fn remote(connection: &str, err: DbErr) -> Self {
        Self::Remote {
            connection: connection.to_string(),
            code: db_error_code(&err),
            message: err.to_string(),
        }
    }

    /// Code and message used by failure classification.
    pub fn failure_info(&self) -> FailureInfo {
        match self {
            SyncError::Database(err) => FailureInfo {
                code: db_error_code(err),
                message: err.to_string(),
            },
            SyncError::Remote { code, message, .. } => FailureInfo {
                code: code.clone(),
                message: message.clone(),
            },
            other => FailureInfo {
                code: None,
                message: other.to_string(),
            },
        }
    }

    /// True when a branch connection does not have the requested table at all.
    /// Warehouse-side errors never qualify.
    pub fn is_missing_relation(&self) -> bool {
        let SyncError::Remote { code, message, .. } = self else {
            return false;
        };
        if code.as_deref() == Some(PG_UNDEFINED_TABLE) {
            return true;
        }
        missing_relation_signatures().is_match(message)
    }

    /// True when an ON CONFLICT clause has no matching unique or exclusion constraint.
    pub fn is_missing_conflict_target(&self) -> bool {
        let info = self.failure_info();
        if info.code.as_deref() == Some(PG_INVALID_COLUMN_REFERENCE) {
            return true;
        }
        let message = info.message.to_lowercase();
        message.contains("no unique or exclusion constraint")
            || message.contains("does not match any primary key or unique constraint")
    }
}

const PG_UNDEFINED_TABLE: &str = "42P01";
const PG_INVALID_COLUMN_REFERENCE: &str = "42P10";

/// Missing-table messages per backend. The Postgres form must follow a `:` so
/// that `column "x" of relation "y" does not exist` is not matched.
const MISSING_RELATION_SIGNATURES: &[&str] = &[
    r"no such table",
    r#"(^|:\s*)relation "[^"]+" does not exist"#,
    r"table '[^']+' doesn't exist",
];

fn missing_relation_signatures() -> &'static RegexSet {
    static SIGNATURES: OnceLock<RegexSet> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        let patterns: Vec<String> = MISSING_RELATION_SIGNATURES
            .iter()
            .map(|pattern| format!("(?i){}", pattern))
            .collect();
        RegexSet::new(patterns).expect("missing relation signatures are valid regexes")
    })
}

/// Extract the vendor error code from a SeaORM error, if the driver reported one.
pub fn db_error_code(error: &DbErr) -> Option<String> {
    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Conn(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return None,
    };

    let db_error = runtime_err.as_database_error()?;
    db_error.code().map(|code| code.into_owned())
}
