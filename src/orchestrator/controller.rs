//! Run controller
//!
//! The surface the CLI / control panel talks to: start a batch without
//! blocking, poll status at any time, request a cooperative stop, then
//! collect the final summary. The pool is built per run (context mode is
//! fixed for a pool's lifetime) and torn down when the run settles; the
//! controller itself is an explicit instance, never a global.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backoff::BackoffPolicy;
use super::diagnostics::{DiagnosticCapture, NoopCapture};
use super::monitor::{JsonFileSink, LiveMonitor, MonitorStats};
use super::pool::EnginePool;
use super::queue_wait::{MarkerProbe, QueueWaitWatcher};
use super::retry::RetryExecutor;
use super::scheduler::{BatchScheduler, RunSummary};
use super::session_runner::SessionRunner;
use super::workflow::WorkflowExecutor;
use crate::domain::events::MonitorEvent;
use crate::infrastructure::config::{AppConfig, ContextMode, PoolSettings, SuccessPolicy};
use crate::infrastructure::engine::EngineLauncher;

/// Poll-safe view of the current run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub is_running: bool,
    pub counts: MonitorStats,
    pub recent_events: Vec<MonitorEvent>,
}

struct ActiveRun {
    monitor: Arc<LiveMonitor>,
    stop: CancellationToken,
    /// Holds `None` while the run task is in flight and the summary once
    /// it settles; the sender side drops if the task panics.
    done: watch::Receiver<Option<RunSummary>>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        // A closed channel with no value means the run task died.
        self.done.borrow().is_none() && self.done.has_changed().is_ok()
    }
}

/// One controller per load test; owns no global state.
pub struct LoadController {
    launcher: Arc<dyn EngineLauncher>,
    executor: Arc<dyn WorkflowExecutor>,
    capture: Arc<dyn DiagnosticCapture>,
    config: AppConfig,
    test_name: String,
    active: RwLock<Option<Arc<ActiveRun>>>,
    last_summary: RwLock<Option<RunSummary>>,
}

impl LoadController {
    #[must_use]
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        executor: Arc<dyn WorkflowExecutor>,
        config: AppConfig,
        test_name: impl Into<String>,
    ) -> Self {
        Self {
            launcher,
            executor,
            capture: Arc::new(NoopCapture),
            config,
            test_name: test_name.into(),
            active: RwLock::new(None),
            last_summary: RwLock::new(None),
        }
    }

    /// Swaps in a diagnostic-capture implementation.
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn DiagnosticCapture>) -> Self {
        self.capture = capture;
        self
    }

    /// Starts a batch run without blocking. Fails if a run is in flight.
    pub async fn run_batch(
        &self,
        total_count: usize,
        concurrency: usize,
        mode: ContextMode,
    ) -> anyhow::Result<()> {
        let mut active = self.active.write().await;
        if let Some(run) = active.as_ref() {
            if run.is_running() {
                anyhow::bail!("a batch run is already in progress");
            }
        }

        let pool_settings = PoolSettings {
            context_mode: mode,
            ..self.config.pool.clone()
        };
        let pool = Arc::new(EnginePool::new(Arc::clone(&self.launcher), pool_settings));

        let monitor = Arc::new(self.build_monitor());
        monitor.start_periodic_flush(Duration::from_secs(
            self.config.monitor.flush_interval_secs.max(1),
        ));

        let retry = Arc::new(
            RetryExecutor::new(BackoffPolicy::from_settings(&self.config.retry))
                .with_capture(Arc::clone(&self.capture)),
        );
        let probe =
            MarkerProbe::from_settings(&self.config.queue_wait).context("queue-wait signatures")?;
        let queue_wait = Arc::new(QueueWaitWatcher::new(Arc::new(probe), &self.config.queue_wait));

        let runner = Arc::new(SessionRunner::new(
            Arc::clone(&pool),
            Arc::clone(&self.executor),
            Arc::clone(&monitor),
            retry,
            queue_wait,
            Arc::clone(&self.capture),
            self.config.scheduler.target_policy,
            self.config.retry.max_retries,
        ));
        let scheduler = BatchScheduler::new(runner, self.config.scheduler.clone());
        let stop = scheduler.stop_token();

        let (done_tx, done_rx) = watch::channel(None);
        let run_monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            let summary = scheduler.run(total_count, concurrency).await;
            pool.shutdown().await;
            run_monitor.stop_monitoring().await;
            let _ = done_tx.send(Some(summary));
        });

        info!(
            "🚀 [{}] batch accepted: {} sessions, concurrency {}, mode {:?}",
            self.test_name, total_count, concurrency, mode
        );
        *active = Some(Arc::new(ActiveRun {
            monitor,
            stop,
            done: done_rx,
        }));
        Ok(())
    }

    /// Sets the cooperative stop flag. Mid-wave sessions settle normally.
    pub async fn stop(&self) {
        if let Some(run) = self.active.read().await.as_ref() {
            info!("🛑 [{}] stop requested", self.test_name);
            run.stop.cancel();
        }
    }

    /// Safe to poll at any time, including mid-run.
    pub async fn status(&self) -> RunStatus {
        let Some(run) = self.active.read().await.as_ref().map(Arc::clone) else {
            return RunStatus {
                is_running: false,
                counts: MonitorStats::default(),
                recent_events: Vec::new(),
            };
        };

        RunStatus {
            is_running: run.is_running(),
            counts: run.monitor.snapshot().await.stats,
            recent_events: run.monitor.recent_events().await,
        }
    }

    /// Awaits the in-flight run and returns its summary. Any number of
    /// callers may wait concurrently, and a caller cancelled mid-wait can
    /// come back and still collect the summary.
    pub async fn wait_for_completion(&self) -> anyhow::Result<RunSummary> {
        let run = self
            .active
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .context("no batch run was started")?;

        let mut done = run.done.clone();
        let summary = loop {
            if let Some(summary) = done.borrow_and_update().clone() {
                break summary;
            }
            done.changed().await.context("batch run task aborted")?;
        };

        *self.last_summary.write().await = Some(summary.clone());
        Ok(summary)
    }

    /// Summary of the most recently collected run, if any.
    pub async fn last_summary(&self) -> Option<RunSummary> {
        self.last_summary.read().await.clone()
    }

    /// Whether the run satisfied the configured success policy.
    #[must_use]
    pub fn run_succeeded(summary: &RunSummary, policy: SuccessPolicy) -> bool {
        match policy {
            SuccessPolicy::All => summary.total > 0 && summary.failed == 0,
            SuccessPolicy::Any => summary.successful > 0,
        }
    }

    fn build_monitor(&self) -> LiveMonitor {
        let monitor = LiveMonitor::new(self.test_name.clone(), &self.config.monitor);
        match self.snapshot_path() {
            Some(path) => monitor.with_sink(Arc::new(JsonFileSink::new(path))),
            None => monitor,
        }
    }

    fn snapshot_path(&self) -> Option<std::path::PathBuf> {
        if let Some(path) = &self.config.monitor.snapshot_path {
            return Some(path.clone());
        }
        match crate::infrastructure::config::ConfigManager::get_app_data_dir() {
            Ok(data_dir) => Some(
                data_dir
                    .join("snapshots")
                    .join(format!("{}.json", self.test_name)),
            ),
            Err(e) => {
                warn!("⚠️  no data dir for snapshots, persistence disabled: {}", e);
                None
            }
        }
    }
}
