//! Workflow executor seam
//!
//! The site-specific multi-step automation lives behind the
//! `WorkflowExecutor` trait, entirely outside the orchestrator core. The
//! orchestrator hands each execution a `WorkflowContext` carrying the
//! retry engine, queue-wait watcher, monitor and diagnostic port, so
//! executors ride out waiting rooms and retry network-sensitive calls the
//! same way the core does.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::diagnostics::DiagnosticCapture;
use super::monitor::LiveMonitor;
use super::queue_wait::QueueWaitWatcher;
use super::retry::{CategorizedError, RetryExecutor};
use crate::domain::session::{ErrorRecord, StepTiming};
use crate::infrastructure::config::TargetPolicy;
use crate::infrastructure::engine::PageHandle;

/// Everything an executor needs beyond the page itself.
pub struct WorkflowContext {
    pub session_id: String,
    pub retry: Arc<RetryExecutor>,
    pub queue_wait: Arc<QueueWaitWatcher>,
    pub monitor: Arc<LiveMonitor>,
    pub capture: Arc<dyn DiagnosticCapture>,
    /// Fallback policy when no available workflow target is found
    pub target_policy: TargetPolicy,
    /// Retry budget for network-sensitive operations
    pub max_retries: u32,
}

/// What an executor hands back for a settled session.
#[derive(Debug, Default)]
pub struct WorkflowOutcome {
    pub success: bool,
    pub step_times: Vec<StepTiming>,
    pub errors: Vec<ErrorRecord>,
    pub result: Option<serde_json::Value>,
}

impl WorkflowOutcome {
    #[must_use]
    pub fn succeeded(result: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            result,
            ..Self::default()
        }
    }
}

/// The external multi-step automation. `Err` means the workflow was cut
/// short by an unhandled error; `Ok` with `success = false` means it ran
/// to a controlled failure.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    async fn execute(
        &self,
        page: Arc<dyn PageHandle>,
        ctx: &WorkflowContext,
    ) -> anyhow::Result<WorkflowOutcome>;
}

/// Deterministic executor for tests and the sanity runner: walks a fixed
/// step list, optionally raising scripted failures for chosen sessions.
pub struct ScriptedWorkflow {
    steps: Vec<(String, Duration)>,
    /// session id -> (step, message) raising a critical error
    critical_failures: Mutex<HashMap<String, (String, String)>>,
    /// session id -> number of transient failures before "checkout" works
    transient_failures: Mutex<HashMap<String, u32>>,
    /// Ride out the waiting room after the first step
    pub check_waiting_room: bool,
}

impl ScriptedWorkflow {
    #[must_use]
    pub fn new(steps: Vec<(&str, Duration)>) -> Self {
        Self {
            steps: steps
                .into_iter()
                .map(|(name, duration)| (name.to_string(), duration))
                .collect(),
            critical_failures: Mutex::new(HashMap::new()),
            transient_failures: Mutex::new(HashMap::new()),
            check_waiting_room: false,
        }
    }

    /// A small plausible default flow.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            ("open-landing", Duration::from_millis(120)),
            ("select-target", Duration::from_millis(80)),
            ("fill-form", Duration::from_millis(200)),
            ("checkout", Duration::from_millis(150)),
        ])
    }

    /// Scripts a critical (never retried) failure for one session.
    pub async fn fail_critical(&self, session_id: &str, step: &str, message: &str) {
        self.critical_failures
            .lock()
            .await
            .insert(session_id.to_string(), (step.to_string(), message.to_string()));
    }

    /// Scripts `count` transient failures at the checkout step.
    pub async fn fail_transient(&self, session_id: &str, count: u32) {
        self.transient_failures
            .lock()
            .await
            .insert(session_id.to_string(), count);
    }
}

#[async_trait]
impl WorkflowExecutor for ScriptedWorkflow {
    async fn execute(
        &self,
        page: Arc<dyn PageHandle>,
        ctx: &WorkflowContext,
    ) -> anyhow::Result<WorkflowOutcome> {
        let mut outcome = WorkflowOutcome::default();

        for (position, (step, duration)) in self.steps.iter().enumerate() {
            ctx.monitor.update_step(&ctx.session_id, step).await;
            let step_started = tokio::time::Instant::now();

            if position == 0 && self.check_waiting_room {
                ctx.queue_wait
                    .wait_for_completion(page.as_ref(), &ctx.session_id, &ctx.monitor)
                    .await?;
            }

            if let Some((fail_step, message)) =
                self.critical_failures.lock().await.get(&ctx.session_id).cloned()
            {
                if fail_step == *step {
                    return Err(CategorizedError::critical(message).into());
                }
            }

            if *step == "checkout" {
                let budget = self
                    .transient_failures
                    .lock()
                    .await
                    .get(&ctx.session_id)
                    .copied()
                    .unwrap_or(0);
                let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
                let attempts_in = Arc::clone(&attempts);
                ctx.retry
                    .execute(
                        &format!("{}:checkout", ctx.session_id),
                        move || {
                            let attempts = Arc::clone(&attempts_in);
                            async move {
                                if attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < budget {
                                    anyhow::bail!("connection reset during checkout")
                                }
                                Ok(())
                            }
                        },
                        ctx.max_retries,
                    )
                    .await?;
            } else {
                tokio::time::sleep(*duration).await;
            }

            outcome.step_times.push(StepTiming {
                name: step.clone(),
                duration_ms: step_started.elapsed().as_millis() as u64,
            });
        }

        outcome.success = true;
        outcome.result = Some(serde_json::json!({ "completedSteps": outcome.step_times.len() }));
        Ok(outcome)
    }
}
