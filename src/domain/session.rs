//! Session domain model
//!
//! A `Session` is one simulated end-to-end user run through the external
//! workflow. It is owned exclusively by the scheduler until it reaches a
//! terminal state, after which its summary is handed to the monitor and the
//! session itself is dropped from active tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Admitted into a wave, resources not yet acquired
    Registered,
    /// Workflow execution in progress
    Running,
    /// Workflow finished successfully
    Completed,
    /// Workflow aborted with an error or timeout
    Failed,
}

impl SessionStatus {
    /// Whether the session has settled (no further transitions allowed).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Severity category attached to errors for downstream policy.
///
/// The retry engine tags but never acts on `Recoverable`; `Critical` is
/// never retried (payment-path failures and the like); `Timeout` is treated
/// as recoverable unless repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Recoverable,
    Critical,
    Timeout,
}

/// Append-only error record captured at the session boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Workflow step that produced the error
    pub step: String,
    /// Human-readable error message
    pub message: String,
    /// Whether the retry engine considered this retryable
    pub retryable: bool,
    /// Severity category for reporting and abort policy
    pub category: ErrorCategory,
    /// Optional diagnostic artifact path (screenshot, page dump)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// When the error was recorded
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    #[must_use]
    pub fn new(step: impl Into<String>, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
            retryable: !matches!(category, ErrorCategory::Critical),
            category,
            artifact: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifact = Some(path.into());
        self
    }
}

/// One named step and how long it took. Order of insertion is preserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTiming {
    pub name: String,
    pub duration_ms: u64,
}

/// One simulated user's lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Ordered step-name -> duration mapping
    pub step_times: Vec<StepTiming>,
    /// Append-only error history
    pub errors: Vec<ErrorRecord>,
    /// Opaque result payload handed back by the workflow executor
    pub result: Option<serde_json::Value>,
}

impl Session {
    /// Creates a session in `Registered` state with the given id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: SessionStatus::Registered,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            step_times: Vec::new(),
            errors: Vec::new(),
            result: None,
        }
    }

    /// Creates a session with a generated v4 id.
    #[must_use]
    pub fn with_generated_id() -> Self {
        Self::new(format!("session-{}", uuid::Uuid::new_v4()))
    }

    /// Marks the actual start of workflow execution.
    pub fn mark_started(&mut self) {
        self.status = SessionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Appends a step timing, preserving insertion order.
    pub fn record_step(&mut self, timing: StepTiming) {
        self.step_times.push(timing);
    }

    /// Appends an error record. Records are never mutated after the fact.
    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    /// Transitions to a terminal state and stamps the end time.
    pub fn complete(&mut self, success: bool, result: Option<serde_json::Value>) {
        self.status = if success {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        };
        self.ended_at = Some(Utc::now());
        self.result = result;
    }

    /// Wall-clock duration from actual start to end, if both are known.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    /// Name of the most recently recorded step, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.step_times.last().map(|s| s.name.as_str())
    }

    /// Condenses the session into the summary shape used by snapshots.
    #[must_use]
    pub fn summarize(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id.clone(),
            status: self.status,
            current_step: self.current_step().map(ToOwned::to_owned),
            start_time: self.started_at,
            end_time: self.ended_at,
            duration: self.duration().map(|d| d.as_millis() as u64),
            errors: self.errors.clone(),
        }
    }
}

/// Snapshot-facing view of a session (persisted JSON shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub errors: Vec<ErrorRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lifecycle_transitions() {
        let mut session = Session::new("s-001");
        assert_eq!(session.status, SessionStatus::Registered);
        assert!(!session.status.is_terminal());

        session.mark_started();
        assert_eq!(session.status, SessionStatus::Running);
        assert!(session.started_at.is_some());

        session.record_step(StepTiming { name: "login".into(), duration_ms: 320 });
        session.record_step(StepTiming { name: "checkout".into(), duration_ms: 810 });
        session.complete(true, Some(serde_json::json!({"order": "A-1"})));

        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.status.is_terminal());
        assert_eq!(session.current_step(), Some("checkout"));
        assert!(session.duration().is_some());
    }

    #[test]
    fn error_records_are_append_only_and_ordered() {
        let mut session = Session::new("s-002");
        session.record_error(ErrorRecord::new("login", "timeout on submit", ErrorCategory::Timeout));
        session.record_error(
            ErrorRecord::new("payment", "card declined path broken", ErrorCategory::Critical)
                .with_artifact("captures/s-002-payment.png"),
        );

        assert_eq!(session.errors.len(), 2);
        assert_eq!(session.errors[0].step, "login");
        assert!(session.errors[0].retryable);
        assert!(!session.errors[1].retryable);
        assert_eq!(session.errors[1].artifact.as_deref(), Some("captures/s-002-payment.png"));
    }

    #[test]
    fn summary_serializes_camel_case() {
        let mut session = Session::new("s-003");
        session.mark_started();
        session.complete(false, None);

        let json = serde_json::to_value(session.summarize()).expect("serialize summary");
        assert_eq!(json["sessionId"], "s-003");
        assert_eq!(json["status"], "failed");
        assert!(json.get("startTime").is_some());
    }
}
