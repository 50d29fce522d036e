//! Live monitor
//!
//! Event sink for all running sessions. Maintains aggregate counters under
//! a single `RwLock` (registration and terminal transitions mutate under
//! the same lock, so a snapshot can never observe `completed + failed >
//! total`), keeps a bounded recent-event feed for status polling, and
//! periodically persists a snapshot through the `SnapshotSink` port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::{ErrorBucket, MonitorEvent};
use crate::domain::session::{SessionStatus, SessionSummary};
use crate::infrastructure::config::MonitorSettings;

/// Aggregate counters, shaped for the persisted snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStats {
    pub total: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub waiting: u64,
    /// Per-step occurrence counters
    pub step_stats: HashMap<String, u64>,
    pub errors_by_step: HashMap<String, u64>,
    pub errors_by_type: HashMap<String, u64>,
    pub waiting_page_encounters: u64,
    /// Running average waiting-room ride-out, in milliseconds
    pub avg_wait_time: u64,
}

/// Persisted snapshot of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub test_name: String,
    pub start_time: DateTime<Utc>,
    /// Elapsed wall-clock milliseconds since the run started
    pub elapsed: u64,
    pub stats: MonitorStats,
    pub sessions: Vec<SessionSummary>,
}

/// Persistence port for snapshots; file layout is the sink's concern.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn persist(&self, snapshot: &MonitorSnapshot) -> anyhow::Result<()>;
}

/// Writes the snapshot as pretty JSON to a fixed path, rebuilt in place.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SnapshotSink for JsonFileSink {
    async fn persist(&self, snapshot: &MonitorSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MonitorInner {
    total: u64,
    running: u64,
    completed: u64,
    failed: u64,
    step_stats: HashMap<String, u64>,
    errors_by_step: HashMap<String, u64>,
    errors_by_type: HashMap<String, u64>,
    waiting_page_encounters: u64,
    wait_passes: u64,
    total_wait_ms: u64,
    /// Sessions currently riding out a waiting room
    waiting_sessions: std::collections::HashSet<String>,
    /// Terminal summaries plus a live view of in-flight sessions
    sessions: HashMap<String, SessionSummary>,
    session_order: Vec<String>,
}

/// Aggregating event sink shared by every session in a run.
pub struct LiveMonitor {
    test_name: String,
    started_at: DateTime<Utc>,
    inner: RwLock<MonitorInner>,
    recent: RwLock<VecDeque<MonitorEvent>>,
    recent_capacity: usize,
    sink: Option<Arc<dyn SnapshotSink>>,
    flush_cancel: CancellationToken,
    flush_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LiveMonitor {
    #[must_use]
    pub fn new(test_name: impl Into<String>, settings: &MonitorSettings) -> Self {
        Self {
            test_name: test_name.into(),
            started_at: Utc::now(),
            inner: RwLock::new(MonitorInner::default()),
            recent: RwLock::new(VecDeque::new()),
            recent_capacity: settings.recent_events_capacity.max(1),
            sink: None,
            flush_cancel: CancellationToken::new(),
            flush_task: Mutex::new(None),
        }
    }

    /// Attaches the persistence sink used by periodic and final flushes.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Registers a session admitted into a wave.
    pub async fn register_session(&self, session_id: &str) {
        {
            let mut inner = self.inner.write().await;
            inner.total += 1;
            if !inner.sessions.contains_key(session_id) {
                inner.session_order.push(session_id.to_string());
            }
            inner.sessions.insert(
                session_id.to_string(),
                SessionSummary {
                    session_id: session_id.to_string(),
                    status: SessionStatus::Registered,
                    current_step: None,
                    start_time: None,
                    end_time: None,
                    duration: None,
                    errors: Vec::new(),
                },
            );
        }
        self.push_event(MonitorEvent::SessionRegistered {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Marks actual workflow start.
    pub async fn start_session(&self, session_id: &str) {
        {
            let mut inner = self.inner.write().await;
            inner.running += 1;
            if let Some(summary) = inner.sessions.get_mut(session_id) {
                summary.status = SessionStatus::Running;
                summary.start_time = Some(Utc::now());
            }
        }
        self.push_event(MonitorEvent::SessionStarted {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Records that a session entered a named workflow step.
    pub async fn update_step(&self, session_id: &str, step: &str) {
        {
            let mut inner = self.inner.write().await;
            *inner.step_stats.entry(step.to_string()).or_insert(0) += 1;
            if let Some(summary) = inner.sessions.get_mut(session_id) {
                summary.current_step = Some(step.to_string());
            }
        }
        self.push_event(MonitorEvent::StepUpdated {
            session_id: session_id.to_string(),
            step: step.to_string(),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Records a waiting-room encounter (or an updated poll observation).
    pub async fn record_waiting_page(
        &self,
        session_id: &str,
        position: Option<u32>,
        estimated_wait: Option<Duration>,
    ) {
        {
            let mut inner = self.inner.write().await;
            if inner.waiting_sessions.insert(session_id.to_string()) {
                inner.waiting_page_encounters += 1;
            }
        }
        self.push_event(MonitorEvent::WaitingDetected {
            session_id: session_id.to_string(),
            position,
            estimated_wait_secs: estimated_wait.map(|d| d.as_secs()),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Records that a session passed the waiting room after `waited`.
    pub async fn record_waiting_passed(&self, session_id: &str, waited: Duration) {
        {
            let mut inner = self.inner.write().await;
            inner.waiting_sessions.remove(session_id);
            inner.wait_passes += 1;
            inner.total_wait_ms += waited.as_millis() as u64;
        }
        self.push_event(MonitorEvent::WaitingPassed {
            session_id: session_id.to_string(),
            waited_ms: waited.as_millis() as u64,
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Records an error against a step; bucketed by message pattern.
    pub async fn record_error(&self, session_id: &str, step: &str, message: &str) {
        let bucket = ErrorBucket::classify(message);
        {
            let mut inner = self.inner.write().await;
            *inner.errors_by_step.entry(step.to_string()).or_insert(0) += 1;
            *inner.errors_by_type.entry(bucket.label().to_string()).or_insert(0) += 1;
        }
        debug!("📋 error recorded for {} at '{}' [{}]", session_id, step, bucket.label());
        self.push_event(MonitorEvent::ErrorRecorded {
            session_id: session_id.to_string(),
            step: step.to_string(),
            bucket,
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Stores the terminal summary and settles the aggregate counters.
    pub async fn complete_session(&self, summary: SessionSummary) {
        let session_id = summary.session_id.clone();
        let success = summary.status == SessionStatus::Completed;
        {
            let mut inner = self.inner.write().await;
            let was_running = inner
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.status == SessionStatus::Running);
            let already_terminal = inner
                .sessions
                .get(&session_id)
                .is_some_and(|s| s.status.is_terminal());
            if already_terminal {
                warn!("⚠️  duplicate completion ignored for {}", session_id);
            } else {
                if was_running && inner.running > 0 {
                    inner.running -= 1;
                }
                if success {
                    inner.completed += 1;
                } else {
                    inner.failed += 1;
                }
                inner.waiting_sessions.remove(&session_id);
                if !inner.sessions.contains_key(&session_id) {
                    inner.session_order.push(session_id.clone());
                }
                inner.sessions.insert(session_id.clone(), summary);
            }
        }
        self.push_event(MonitorEvent::SessionCompleted {
            session_id,
            success,
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Builds a point-in-time snapshot. Eventually consistent with respect
    /// to concurrent writers, but internally coherent (single read lock).
    pub async fn snapshot(&self) -> MonitorSnapshot {
        let inner = self.inner.read().await;
        let avg_wait_time = if inner.wait_passes > 0 {
            inner.total_wait_ms / inner.wait_passes
        } else {
            0
        };

        MonitorSnapshot {
            test_name: self.test_name.clone(),
            start_time: self.started_at,
            elapsed: (Utc::now() - self.started_at).num_milliseconds().max(0) as u64,
            stats: MonitorStats {
                total: inner.total,
                running: inner.running,
                completed: inner.completed,
                failed: inner.failed,
                waiting: inner.waiting_sessions.len() as u64,
                step_stats: inner.step_stats.clone(),
                errors_by_step: inner.errors_by_step.clone(),
                errors_by_type: inner.errors_by_type.clone(),
                waiting_page_encounters: inner.waiting_page_encounters,
                avg_wait_time,
            },
            sessions: inner
                .session_order
                .iter()
                .filter_map(|id| inner.sessions.get(id).cloned())
                .collect(),
        }
    }

    /// Recent events, oldest first, for status polling.
    pub async fn recent_events(&self) -> Vec<MonitorEvent> {
        self.recent.read().await.iter().cloned().collect()
    }

    /// Spawns the periodic snapshot flush task. Producers are never
    /// blocked; the task takes its own snapshot on each tick.
    pub fn start_periodic_flush(self: &Arc<Self>, interval: Duration) {
        let monitor = Arc::clone(self);
        let cancel = self.flush_cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.flush().await;
                    }
                }
            }
        });

        if let Ok(mut slot) = self.flush_task.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Persists one snapshot through the sink, logging a one-line digest.
    pub async fn flush(&self) {
        let snapshot = self.snapshot().await;
        info!(
            "📊 [{}] total={} running={} completed={} failed={} waiting={}",
            snapshot.test_name,
            snapshot.stats.total,
            snapshot.stats.running,
            snapshot.stats.completed,
            snapshot.stats.failed,
            snapshot.stats.waiting
        );
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.persist(&snapshot).await {
                warn!("⚠️  Snapshot persistence failed: {}", e);
            }
        }
    }

    /// Stops the periodic flush and persists a final snapshot.
    pub async fn stop_monitoring(&self) -> MonitorSnapshot {
        self.flush_cancel.cancel();
        if let Some(handle) = self.flush_task.lock().await.take() {
            let _ = handle.await;
        }
        self.flush().await;
        self.snapshot().await
    }

    async fn push_event(&self, event: MonitorEvent) {
        let mut recent = self.recent.write().await;
        if recent.len() == self.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::session::Session;
    use tempfile::tempdir;

    fn monitor() -> LiveMonitor {
        LiveMonitor::new("unit", &MonitorSettings::default())
    }

    #[tokio::test]
    async fn counters_follow_the_session_lifecycle() {
        let monitor = monitor();

        monitor.register_session("s-1").await;
        monitor.register_session("s-2").await;
        monitor.start_session("s-1").await;
        monitor.update_step("s-1", "login").await;

        let snap = monitor.snapshot().await;
        assert_eq!(snap.stats.total, 2);
        assert_eq!(snap.stats.running, 1);
        assert_eq!(snap.stats.step_stats.get("login"), Some(&1));

        let mut session = Session::new("s-1");
        session.mark_started();
        session.complete(true, None);
        monitor.complete_session(session.summarize()).await;

        let snap = monitor.snapshot().await;
        assert_eq!(snap.stats.completed, 1);
        assert_eq!(snap.stats.running, 0);
        assert!(snap.stats.completed + snap.stats.failed <= snap.stats.total);
    }

    #[tokio::test]
    async fn duplicate_completion_is_ignored() {
        let monitor = monitor();
        monitor.register_session("s-1").await;

        let mut session = Session::new("s-1");
        session.mark_started();
        session.complete(false, None);
        monitor.complete_session(session.summarize()).await;
        monitor.complete_session(session.summarize()).await;

        let snap = monitor.snapshot().await;
        assert_eq!(snap.stats.failed, 1);
        assert!(snap.stats.completed + snap.stats.failed <= snap.stats.total);
    }

    #[tokio::test]
    async fn waiting_encounters_and_average_wait() {
        let monitor = monitor();
        monitor.register_session("s-1").await;

        monitor.record_waiting_page("s-1", Some(10), Some(Duration::from_secs(60))).await;
        // repeated polls of the same session count once
        monitor.record_waiting_page("s-1", Some(4), None).await;
        monitor.record_waiting_passed("s-1", Duration::from_millis(4_000)).await;

        let snap = monitor.snapshot().await;
        assert_eq!(snap.stats.waiting_page_encounters, 1);
        assert_eq!(snap.stats.waiting, 0);
        assert_eq!(snap.stats.avg_wait_time, 4_000);
    }

    #[tokio::test]
    async fn errors_bucket_by_message_pattern() {
        let monitor = monitor();
        monitor.register_session("s-1").await;
        monitor.record_error("s-1", "login", "Timeout 30000ms exceeded").await;
        monitor.record_error("s-1", "seats", "element .seat not clickable").await;
        monitor.record_error("s-1", "seats", "net::ERR_CONNECTION_RESET").await;

        let snap = monitor.snapshot().await;
        assert_eq!(snap.stats.errors_by_step.get("seats"), Some(&2));
        assert_eq!(snap.stats.errors_by_type.get("timeout"), Some(&1));
        assert_eq!(snap.stats.errors_by_type.get("ui_element"), Some(&1));
        assert_eq!(snap.stats.errors_by_type.get("network"), Some(&1));
    }

    #[tokio::test]
    async fn recent_event_feed_is_bounded() {
        let settings = MonitorSettings {
            recent_events_capacity: 3,
            ..MonitorSettings::default()
        };
        let monitor = LiveMonitor::new("unit", &settings);
        for i in 0..10 {
            monitor.update_step("s-1", &format!("step-{i}")).await;
        }
        let events = monitor.recent_events().await;
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn snapshot_persists_through_json_sink() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("snapshots/run.json");
        let monitor = Arc::new(
            LiveMonitor::new("sink-test", &MonitorSettings::default())
                .with_sink(Arc::new(JsonFileSink::new(path.clone()))),
        );

        monitor.register_session("s-1").await;
        monitor.flush().await;

        let content = std::fs::read_to_string(&path).expect("snapshot file");
        let json: serde_json::Value = serde_json::from_str(&content).expect("valid json");
        assert_eq!(json["testName"], "sink-test");
        assert_eq!(json["stats"]["total"], 1);
        assert!(json["sessions"].as_array().is_some());
    }
}
