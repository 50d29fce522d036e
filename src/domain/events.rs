//! Monitor event vocabulary and message-pattern error bucketing.
//!
//! Events flow one way: sessions emit, the live monitor aggregates. Buckets
//! are purely a reporting concern and never influence retry behavior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle and step events emitted by sessions toward the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorEvent {
    SessionRegistered {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    SessionStarted {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    StepUpdated {
        session_id: String,
        step: String,
        timestamp: DateTime<Utc>,
    },
    WaitingDetected {
        session_id: String,
        position: Option<u32>,
        estimated_wait_secs: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    WaitingPassed {
        session_id: String,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ErrorRecorded {
        session_id: String,
        step: String,
        bucket: ErrorBucket,
        timestamp: DateTime<Utc>,
    },
    SessionCompleted {
        session_id: String,
        success: bool,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    /// Session this event belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::SessionRegistered { session_id, .. }
            | Self::SessionStarted { session_id, .. }
            | Self::StepUpdated { session_id, .. }
            | Self::WaitingDetected { session_id, .. }
            | Self::WaitingPassed { session_id, .. }
            | Self::ErrorRecorded { session_id, .. }
            | Self::SessionCompleted { session_id, .. } => session_id,
        }
    }
}

/// Reporting buckets for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorBucket {
    Timeout,
    Network,
    UiElement,
    Navigation,
    Other,
}

impl ErrorBucket {
    /// Stable label used as a JSON map key in snapshots.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::UiElement => "ui_element",
            Self::Navigation => "navigation",
            Self::Other => "other",
        }
    }

    /// Classifies a raw error message into a reporting bucket.
    ///
    /// Lower-cased substring matching, same approach as the failure
    /// classifier used for retry classification. First match wins.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") || lower.contains("deadline") {
            return Self::Timeout;
        }
        if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns")
            || lower.contains("socket")
            || lower.contains("econnrefused")
        {
            return Self::Network;
        }
        if lower.contains("selector")
            || lower.contains("element")
            || lower.contains("not visible")
            || lower.contains("not clickable")
            || lower.contains("detached")
        {
            return Self::UiElement;
        }
        if lower.contains("navigation") || lower.contains("goto") || lower.contains("redirect") {
            return Self::Navigation;
        }

        Self::Other
    }
}
