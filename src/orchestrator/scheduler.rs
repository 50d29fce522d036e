//! Batch/concurrency scheduler
//!
//! Drives N sessions with parallelism P in successive waves. Every
//! session in a wave is spawned concurrently and the wave completes only
//! when all of them have settled (join-all, not first-to-finish). One bad
//! session never aborts its siblings or later waves; a cooperative stop
//! flag is checked before each new wave, never mid-wave.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::session_runner::SessionRunner;
use crate::domain::session::{Session, SessionStatus};
use crate::infrastructure::config::SchedulerSettings;

/// Final report of one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// Sessions actually started (equals the request unless stopped early)
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// successful / total, 0.0 for an empty run
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
    /// Size of each executed wave, in order
    pub wave_sizes: Vec<u64>,
}

impl RunSummary {
    fn from_outcomes(outcomes: &[Session], wave_sizes: Vec<u64>) -> Self {
        let total = outcomes.len() as u64;
        let successful = outcomes
            .iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .count() as u64;
        let failed = total - successful;

        let durations: Vec<u64> = outcomes
            .iter()
            .filter_map(|s| s.duration().map(|d| d.as_millis() as u64))
            .collect();
        let (avg, min, max) = if durations.is_empty() {
            (0, 0, 0)
        } else {
            (
                durations.iter().sum::<u64>() / durations.len() as u64,
                *durations.iter().min().unwrap_or(&0),
                *durations.iter().max().unwrap_or(&0),
            )
        };

        Self {
            total,
            successful,
            failed,
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                0.0
            },
            avg_duration_ms: avg,
            min_duration_ms: min,
            max_duration_ms: max,
            wave_sizes,
        }
    }
}

/// Wave-based scheduler over a shared session runner.
pub struct BatchScheduler {
    runner: Arc<SessionRunner>,
    settings: SchedulerSettings,
    stop: CancellationToken,
}

impl BatchScheduler {
    #[must_use]
    pub fn new(runner: Arc<SessionRunner>, settings: SchedulerSettings) -> Self {
        Self {
            runner,
            settings,
            stop: CancellationToken::new(),
        }
    }

    /// Token shared with whoever needs to request a cooperative stop.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Requests a cooperative stop: the in-flight wave settles, no new
    /// wave starts.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Runs `total_count` sessions with at most `concurrency` in flight.
    pub async fn run(&self, total_count: usize, concurrency: usize) -> RunSummary {
        let concurrency = concurrency.max(1);
        let cooldown = Duration::from_millis(self.settings.wave_cooldown_ms);

        info!(
            "🌊 batch run starting: {} sessions, concurrency {}",
            total_count, concurrency
        );

        let mut outcomes: Vec<Session> = Vec::with_capacity(total_count);
        let mut wave_sizes: Vec<u64> = Vec::new();
        let mut started = 0usize;
        let mut wave_no = 0usize;

        while started < total_count {
            if self.stop.is_cancelled() {
                info!("🛑 stop requested, not starting wave {}", wave_no + 1);
                break;
            }

            let wave_size = concurrency.min(total_count - started);
            wave_no += 1;
            info!("🌊 wave {} starting with {} sessions", wave_no, wave_size);

            let handles: Vec<_> = (0..wave_size)
                .map(|offset| {
                    let runner = Arc::clone(&self.runner);
                    let session = Session::new(format!("session-{:04}", started + offset + 1));
                    tokio::spawn(async move { runner.run(session).await })
                })
                .collect();

            // Wave barrier: every member settles before the wave ends.
            for joined in join_all(handles).await {
                match joined {
                    Ok(session) => outcomes.push(session),
                    Err(join_error) => {
                        // A panicked session task counts as a failure and
                        // must not take the wave down with it. The original
                        // record is lost, so stand in a fresh unique id.
                        warn!("⚠️  session task aborted in wave {}: {}", wave_no, join_error);
                        let mut session = Session::with_generated_id();
                        session.complete(false, None);
                        outcomes.push(session);
                    }
                }
            }

            started += wave_size;
            wave_sizes.push(wave_size as u64);

            let wave_failed = outcomes
                .iter()
                .rev()
                .take(wave_size)
                .filter(|s| s.status == SessionStatus::Failed)
                .count();
            info!(
                "🏁 wave {} settled: {} ok, {} failed",
                wave_no,
                wave_size - wave_failed,
                wave_failed
            );

            if started < total_count && !self.stop.is_cancelled() && !cooldown.is_zero() {
                tokio::time::sleep(cooldown).await;
            }
        }

        let summary = RunSummary::from_outcomes(&outcomes, wave_sizes);
        info!(
            "📊 batch run finished: total={} successful={} failed={} (rate {:.1}%)",
            summary.total,
            summary.successful,
            summary.failed,
            summary.success_rate * 100.0
        );
        summary
    }
}
