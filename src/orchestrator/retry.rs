//! Retry/backoff engine
//!
//! Wraps individual operations with bounded retries. Attempt counters are
//! kept per operation key: cleared on success, left in place on exhaustion
//! for inspection until `reset` / `reset_all`. Critical errors abort
//! immediately and are never retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::backoff::BackoffPolicy;
use super::diagnostics::DiagnosticCapture;
use crate::domain::session::ErrorCategory;

/// Typed error a workflow can raise to force a category, bypassing
/// message-pattern classification.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CategorizedError {
    #[must_use]
    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Critical,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Timeout,
            message: message.into(),
        }
    }
}

/// Final outcome of a retry-wrapped operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("operation '{operation}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
        category: ErrorCategory,
        artifact: Option<String>,
    },

    #[error("operation '{operation}' aborted on critical error: {message}")]
    Critical {
        operation: String,
        message: String,
        artifact: Option<String>,
    },
}

impl RetryError {
    /// Category for the session error record.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Exhausted { category, .. } => *category,
            Self::Critical { .. } => ErrorCategory::Critical,
        }
    }

    /// Diagnostic artifact reference, when one was captured.
    #[must_use]
    pub fn artifact(&self) -> Option<&str> {
        match self {
            Self::Exhausted { artifact, .. } | Self::Critical { artifact, .. } => artifact.as_deref(),
        }
    }
}

/// Classifies a raw error into a severity category.
///
/// A `CategorizedError` anywhere in the chain wins; otherwise lower-cased
/// substring buckets, same approach as the monitor's reporting buckets.
#[must_use]
pub fn classify_error(error: &anyhow::Error) -> ErrorCategory {
    if let Some(categorized) = error.downcast_ref::<CategorizedError>() {
        return categorized.category;
    }

    let lower = error.to_string().to_lowercase();
    if lower.contains("payment") || lower.contains("critical") {
        return ErrorCategory::Critical;
    }
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
        return ErrorCategory::Timeout;
    }
    ErrorCategory::Recoverable
}

/// Retry engine with per-operation attempt bookkeeping.
pub struct RetryExecutor {
    policy: BackoffPolicy,
    attempts: RwLock<HashMap<String, u32>>,
    capture: Option<Arc<dyn DiagnosticCapture>>,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: RwLock::new(HashMap::new()),
            capture: None,
        }
    }

    /// Attaches the diagnostic-capture port, invoked on final failures.
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn DiagnosticCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Executes `operation` with up to `max_retries` retries.
    ///
    /// The counter for `operation_name` survives across calls: a failure
    /// mid-way through a previous call means the next call starts deeper
    /// in the backoff schedule, until a success clears it.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        mut operation: F,
        max_retries: u32,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        loop {
            match operation().await {
                Ok(value) => {
                    self.reset(operation_name).await;
                    return Ok(value);
                }
                Err(error) => {
                    let category = classify_error(&error);

                    if category == ErrorCategory::Critical {
                        warn!("🛑 '{}' hit critical error, not retrying: {}", operation_name, error);
                        let artifact = self.capture_final(operation_name, &error).await;
                        return Err(RetryError::Critical {
                            operation: operation_name.to_string(),
                            message: error.to_string(),
                            artifact,
                        });
                    }

                    let attempts = self.bump(operation_name).await;
                    if attempts > max_retries {
                        warn!(
                            "❌ '{}' exhausted after {} attempts: {}",
                            operation_name, attempts, error
                        );
                        let artifact = self.capture_final(operation_name, &error).await;
                        return Err(RetryError::Exhausted {
                            operation: operation_name.to_string(),
                            attempts,
                            last_error: error.to_string(),
                            category,
                            artifact,
                        });
                    }

                    let delay = self.policy.delay_for(attempts - 1);
                    debug!(
                        "🔄 '{}' attempt {} failed ({}), retrying in {:?}",
                        operation_name, attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Current attempt count for an operation key (0 when unknown).
    pub async fn attempt_count(&self, operation_name: &str) -> u32 {
        self.attempts.read().await.get(operation_name).copied().unwrap_or(0)
    }

    /// Clears the attempt counter for one operation key.
    pub async fn reset(&self, operation_name: &str) {
        self.attempts.write().await.remove(operation_name);
    }

    /// Clears every attempt counter.
    pub async fn reset_all(&self) {
        self.attempts.write().await.clear();
    }

    async fn bump(&self, operation_name: &str) -> u32 {
        let mut attempts = self.attempts.write().await;
        let counter = attempts.entry(operation_name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn capture_final(&self, operation_name: &str, error: &anyhow::Error) -> Option<String> {
        let capture = self.capture.as_ref()?;
        match capture.capture(operation_name, &format!("{error:#}")).await {
            Ok(artifact) => artifact,
            Err(capture_error) => {
                warn!("⚠️  Diagnostic capture failed for '{}': {}", operation_name, capture_error);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn executor() -> RetryExecutor {
        RetryExecutor::new(BackoffPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn retries_three_times_with_doubling_delays() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let calls_in = Arc::clone(&calls);
        let result: Result<(), _> = executor
            .execute(
                "fetch-seats",
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        anyhow::bail!("connection reset")
                    }
                },
                3,
            )
            .await;

        // 4 invocations total: initial + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // delays 1000 + 2000 + 4000 under a paused clock
        assert_eq!(started.elapsed(), Duration::from_millis(7_000));

        match result {
            Err(RetryError::Exhausted { operation, attempts, .. }) => {
                assert_eq!(operation, "fetch-seats");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // Counter kept for inspection until reset.
        assert_eq!(executor.attempt_count("fetch-seats").await, 4);

        executor.reset("fetch-seats").await;
        assert_eq!(executor.attempt_count("fetch-seats").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn success_clears_the_attempt_counter() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let value = executor
            .execute(
                "login",
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            anyhow::bail!("flaky network")
                        }
                        Ok(99u32)
                    }
                },
                3,
            )
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 99);
        assert_eq!(executor.attempt_count("login").await, 0);
    }

    #[tokio::test]
    async fn critical_errors_are_never_retried() {
        let executor = executor();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = Arc::clone(&calls);
        let result: Result<(), _> = executor
            .execute(
                "submit-payment",
                move || {
                    let calls = Arc::clone(&calls_in);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(CategorizedError::critical("payment gateway rejected").into())
                    }
                },
                5,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Critical { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_messages_classify_as_timeout_but_still_retry() {
        let executor = executor();
        let result: Result<(), _> = executor
            .execute(
                "poll-status",
                || async { anyhow::bail!("operation timed out after 30s") },
                1,
            )
            .await;

        match result {
            Err(RetryError::Exhausted { category, .. }) => {
                assert_eq!(category, ErrorCategory::Timeout);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_all_clears_every_counter() {
        let executor = executor();
        let _ = executor
            .execute("a", || async { anyhow::bail!("nope") }, 0)
            .await as Result<(), _>;
        let _ = executor
            .execute("b", || async { anyhow::bail!("nope") }, 0)
            .await as Result<(), _>;

        assert_eq!(executor.attempt_count("a").await, 1);
        executor.reset_all().await;
        assert_eq!(executor.attempt_count("a").await, 0);
        assert_eq!(executor.attempt_count("b").await, 0);
    }
}
