//! Retryable executor
//!
//! Runs remote reads and local writes, classifying each failure as transient
//! (connectivity or timeout) or fatal. Transient failures are retried after a
//! fixed delay up to a bounded number of attempts; fatal failures propagate
//! immediately without consuming a retry.

use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::counter;
use regex::RegexSet;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::config::SyncSettings;
use crate::error::{FailureInfo, SyncError};

/// Outcome of failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

/// Attempt bound and fixed delay for one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Policy for regular unit execution.
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_secs(settings.retry_delay_seconds),
        )
    }

    /// Policy for the per-connection final retry phase.
    pub fn final_phase(settings: &SyncSettings) -> Self {
        Self::new(
            settings.final_retry_attempts,
            Duration::from_secs(settings.retry_delay_seconds),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

/// Vendor codes for connectivity loss and timeouts.
///
/// Postgres class 08 (connection exception), admin shutdown, cannot-connect-now,
/// too many connections and lock/statement timeouts; MySQL client-side
/// connection codes and lock wait timeout; SQLite busy/locked.
const TRANSIENT_CODES: &[&str] = &[
    "08000", "08001", "08003", "08004", "08006", "08007", "57P01", "57P02", "57P03", "53300",
    "55P03", "57014", "2002", "2003", "2006", "2013", "1205", "1040", "5", "6",
];

const TRANSIENT_SIGNATURES: &[&str] = &[
    r"timed?\s*out",
    r"timeout",
    r"connection refused",
    r"connection reset",
    r"server closed the connection",
    r"server has gone away",
    r"lost connection",
    r"could not connect",
    r"connection (was )?closed",
    r"broken pipe",
    r"no route to host",
    r"network is unreachable",
    r"too many connections",
    r"database is locked",
    r"pool (is )?closed",
    r"failed to acquire connection",
];

fn transient_signatures() -> &'static RegexSet {
    static SIGNATURES: OnceLock<RegexSet> = OnceLock::new();
    SIGNATURES.get_or_init(|| {
        let patterns: Vec<String> = TRANSIENT_SIGNATURES
            .iter()
            .map(|pattern| format!("(?i){}", pattern))
            .collect();
        RegexSet::new(patterns).expect("transient signatures are valid regexes")
    })
}

/// Classify a failure as transient or fatal from its code and message.
pub fn classify_failure(info: &FailureInfo) -> FailureClass {
    if let Some(code) = info.code.as_deref()
        && TRANSIENT_CODES.contains(&code)
    {
        return FailureClass::Transient;
    }

    if transient_signatures().is_match(&info.message) {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

/// Run `operation`, retrying transient failures according to `policy`.
///
/// `label` only feeds logs and metrics. On exhaustion the error from the final
/// attempt is returned to the caller unchanged.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SyncError>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify_failure(&err.failure_info());
                if class == FailureClass::Fatal {
                    error!(operation = label, attempt, error = %err, "Fatal failure, not retrying");
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    error!(
                        operation = label,
                        attempts = attempt,
                        error = %err,
                        "Transient failure persisted after final attempt"
                    );
                    return Err(err);
                }

                warn!(
                    operation = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_secs = policy.delay.as_secs(),
                    error = %err,
                    "Transient failure, retrying"
                );
                counter!("sync_retry_total").increment(1);

                if !policy.delay.is_zero() {
                    sleep(policy.delay).await;
                }
                attempt += 1;
            }
        }
    }
}
