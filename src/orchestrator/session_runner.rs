//! Session lifecycle glue
//!
//! Runs one session end to end: register with the monitor, acquire pooled
//! resources, hand the page to the workflow executor, record the outcome,
//! and release resources on every path. Errors are captured here and
//! never propagate past the runner; the scheduler only ever sees a
//! settled session.

use std::sync::Arc;
use tracing::{debug, warn};

use super::diagnostics::DiagnosticCapture;
use super::monitor::LiveMonitor;
use super::pool::EnginePool;
use super::queue_wait::{QueueWaitError, QueueWaitWatcher};
use super::retry::{RetryError, RetryExecutor, classify_error};
use super::workflow::{WorkflowContext, WorkflowExecutor};
use crate::domain::session::{ErrorCategory, ErrorRecord, Session};
use crate::infrastructure::config::TargetPolicy;

/// Executes sessions against the shared pool and collaborators.
pub struct SessionRunner {
    pool: Arc<EnginePool>,
    executor: Arc<dyn WorkflowExecutor>,
    monitor: Arc<LiveMonitor>,
    retry: Arc<RetryExecutor>,
    queue_wait: Arc<QueueWaitWatcher>,
    capture: Arc<dyn DiagnosticCapture>,
    target_policy: TargetPolicy,
    max_retries: u32,
}

impl SessionRunner {
    #[must_use]
    pub fn new(
        pool: Arc<EnginePool>,
        executor: Arc<dyn WorkflowExecutor>,
        monitor: Arc<LiveMonitor>,
        retry: Arc<RetryExecutor>,
        queue_wait: Arc<QueueWaitWatcher>,
        capture: Arc<dyn DiagnosticCapture>,
        target_policy: TargetPolicy,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            executor,
            monitor,
            retry,
            queue_wait,
            capture,
            target_policy,
            max_retries,
        }
    }

    /// Runs `session` to a terminal state. Never returns early: resources
    /// are released and the monitor is told however the workflow ends.
    pub async fn run(&self, mut session: Session) -> Session {
        self.monitor.register_session(&session.id).await;

        let resources = match self.pool.acquire(&session.id).await {
            Ok(resources) => resources,
            Err(pool_error) => {
                warn!("❌ [{}] resource acquisition failed: {}", session.id, pool_error);
                let record =
                    ErrorRecord::new("acquire-resources", pool_error.to_string(), ErrorCategory::Recoverable);
                self.monitor
                    .record_error(&session.id, &record.step, &record.message)
                    .await;
                session.record_error(record);
                session.complete(false, None);
                self.monitor.complete_session(session.summarize()).await;
                return session;
            }
        };

        session.mark_started();
        self.monitor.start_session(&session.id).await;
        debug!("▶️  [{}] started on instance {}", session.id, resources.instance_index);

        let ctx = WorkflowContext {
            session_id: session.id.clone(),
            retry: Arc::clone(&self.retry),
            queue_wait: Arc::clone(&self.queue_wait),
            monitor: Arc::clone(&self.monitor),
            capture: Arc::clone(&self.capture),
            target_policy: self.target_policy,
            max_retries: self.max_retries,
        };

        match self.executor.execute(Arc::clone(&resources.page), &ctx).await {
            Ok(outcome) => {
                for timing in outcome.step_times {
                    session.record_step(timing);
                }
                for record in outcome.errors {
                    self.monitor
                        .record_error(&session.id, &record.step, &record.message)
                        .await;
                    session.record_error(record);
                }
                session.complete(outcome.success, outcome.result);
            }
            Err(error) => {
                let record = self.record_for(&session, &error).await;
                self.monitor
                    .record_error(&session.id, &record.step, &record.message)
                    .await;
                session.record_error(record);
                session.complete(false, None);
            }
        }

        self.pool.release(&session.id).await;
        self.monitor.complete_session(session.summarize()).await;
        session
    }

    /// Builds the error record for a workflow-level failure, capturing a
    /// diagnostic artifact for anything that is not a plain retry miss.
    async fn record_for(&self, session: &Session, error: &anyhow::Error) -> ErrorRecord {
        let step = session.current_step().unwrap_or("workflow").to_string();

        // Retry and queue-wait failures carry their own shape.
        if let Some(retry_error) = error.downcast_ref::<RetryError>() {
            let mut record =
                ErrorRecord::new(step, retry_error.to_string(), retry_error.category());
            if let Some(artifact) = retry_error.artifact() {
                record = record.with_artifact(artifact);
            }
            return record;
        }
        if let Some(wait_error) = error.downcast_ref::<QueueWaitError>() {
            return ErrorRecord::new(step, wait_error.to_string(), ErrorCategory::Timeout);
        }

        let category = classify_error(error);
        let mut record = ErrorRecord::new(step.clone(), format!("{error:#}"), category);
        match self
            .capture
            .capture(&format!("{}:{}", session.id, step), &format!("{error:#}"))
            .await
        {
            Ok(Some(artifact)) => record = record.with_artifact(artifact),
            Ok(None) => {}
            Err(capture_error) => {
                warn!("⚠️  [{}] diagnostic capture failed: {}", session.id, capture_error);
            }
        }
        record
    }
}
