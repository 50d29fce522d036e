//! Queue-wait state machine
//!
//! Rides out the server-imposed "waiting room" interstitial:
//! `NotWaiting → Waiting → Passed` on the success path, `Waiting →
//! TimedOut` when the global ceiling is exceeded. Invoked after any
//! navigation-triggering action; detection has to be cheap because of
//! that, so the default probe checks the URL first and only falls back to
//! page content.

use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::monitor::LiveMonitor;
use crate::infrastructure::config::QueueWaitSettings;
use crate::infrastructure::engine::PageHandle;

/// One probe result: are we in the queue, and what does the server say.
#[derive(Debug, Clone, Default)]
pub struct WaitObservation {
    pub waiting: bool,
    pub position: Option<u32>,
    pub estimated_wait: Option<Duration>,
}

/// Detection seam. Site-specific probes implement this; the watcher only
/// decides how often to poll and when to give up.
#[async_trait]
pub trait WaitingRoomProbe: Send + Sync {
    async fn check(&self, page: &dyn PageHandle) -> anyhow::Result<WaitObservation>;
}

/// Default probe: regex signatures over the page location, then over the
/// rendered content when the URL alone is inconclusive.
pub struct MarkerProbe {
    url_signatures: Vec<Regex>,
    content_signatures: Vec<Regex>,
    position_pattern: Regex,
    estimate_pattern: Regex,
}

impl MarkerProbe {
    pub fn from_settings(settings: &QueueWaitSettings) -> anyhow::Result<Self> {
        let compile = |patterns: &[String]| -> anyhow::Result<Vec<Regex>> {
            patterns.iter().map(|p| Ok(Regex::new(p)?)).collect()
        };
        Ok(Self {
            url_signatures: compile(&settings.url_signatures)?,
            content_signatures: compile(&settings.content_signatures)?,
            position_pattern: Regex::new(r"(?i)(?:position|number)[^0-9]{0,24}([0-9]{1,7})")?,
            estimate_pattern: Regex::new(
                r"(?i)estimated wait[^0-9]{0,24}([0-9]{1,5})\s*(minute|min|second|sec)",
            )?,
        })
    }

    fn url_matches(&self, raw_url: &str) -> bool {
        // Match against path+query when the URL parses, raw string otherwise.
        let haystack = Url::parse(raw_url)
            .map(|u| {
                let mut s = u.path().to_string();
                if let Some(q) = u.query() {
                    s.push('?');
                    s.push_str(q);
                }
                s
            })
            .unwrap_or_else(|_| raw_url.to_string());
        self.url_signatures.iter().any(|re| re.is_match(&haystack))
    }

    fn parse_observation(&self, content: &str) -> WaitObservation {
        let position = self
            .position_pattern
            .captures(content)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());

        let estimated_wait = self.estimate_pattern.captures(content).and_then(|c| {
            let value = c.get(1)?.as_str().parse::<u64>().ok()?;
            let unit = c.get(2)?.as_str().to_lowercase();
            let secs = if unit.starts_with("min") { value * 60 } else { value };
            Some(Duration::from_secs(secs))
        });

        WaitObservation {
            waiting: true,
            position,
            estimated_wait,
        }
    }
}

#[async_trait]
impl WaitingRoomProbe for MarkerProbe {
    async fn check(&self, page: &dyn PageHandle) -> anyhow::Result<WaitObservation> {
        let raw_url = page.current_url().await?;
        if self.url_matches(&raw_url) {
            let content = page.content().await.unwrap_or_default();
            return Ok(self.parse_observation(&content));
        }

        if !self.content_signatures.is_empty() {
            let content = page.content().await?;
            if self.content_signatures.iter().any(|re| re.is_match(&content)) {
                return Ok(self.parse_observation(&content));
            }
        }

        Ok(WaitObservation::default())
    }
}

/// Terminal success outcomes of a ride-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueWaitOutcome {
    /// First check already saw a normal page; no sleep happened
    NotEncountered,
    /// The queue was entered and passed after `waited`
    Passed { waited: Duration },
}

#[derive(Debug, Error)]
pub enum QueueWaitError {
    #[error("waiting room not passed within {ceiling:?} (waited {waited:?})")]
    TimedOut { ceiling: Duration, waited: Duration },

    #[error("waiting-room probe failed: {0}")]
    Probe(#[from] anyhow::Error),
}

/// Polls the probe until the queue is passed or the ceiling is hit.
pub struct QueueWaitWatcher {
    probe: Arc<dyn WaitingRoomProbe>,
    max_wait: Duration,
    default_poll: Duration,
    max_poll: Duration,
}

impl QueueWaitWatcher {
    #[must_use]
    pub fn new(probe: Arc<dyn WaitingRoomProbe>, settings: &QueueWaitSettings) -> Self {
        Self {
            probe,
            max_wait: Duration::from_secs(settings.max_wait_secs),
            default_poll: Duration::from_secs(settings.default_poll_secs),
            max_poll: Duration::from_secs(settings.max_poll_secs),
        }
    }

    /// Rides out the waiting room on `page`, reporting observations to the
    /// monitor. Returns immediately (no sleep) when the first check sees a
    /// normal page; returns `TimedOut` as a session-level failure once
    /// `max_wait` has elapsed.
    pub async fn wait_for_completion(
        &self,
        page: &dyn PageHandle,
        session_id: &str,
        monitor: &LiveMonitor,
    ) -> Result<QueueWaitOutcome, QueueWaitError> {
        let started = tokio::time::Instant::now();

        let mut observation = self.probe.check(page).await?;
        if !observation.waiting {
            return Ok(QueueWaitOutcome::NotEncountered);
        }

        info!(
            "⏳ [{}] waiting room detected (position: {:?}, estimate: {:?})",
            session_id, observation.position, observation.estimated_wait
        );

        loop {
            monitor
                .record_waiting_page(session_id, observation.position, observation.estimated_wait)
                .await;

            let interval = observation
                .estimated_wait
                .map_or(self.default_poll, |estimate| estimate.min(self.max_poll));
            debug!("⏳ [{}] re-checking waiting room in {:?}", session_id, interval);
            tokio::time::sleep(interval).await;

            observation = self.probe.check(page).await?;
            let waited = started.elapsed();

            if !observation.waiting {
                info!("✅ [{}] waiting room passed after {:?}", session_id, waited);
                monitor.record_waiting_passed(session_id, waited).await;
                return Ok(QueueWaitOutcome::Passed { waited });
            }

            if waited >= self.max_wait {
                return Err(QueueWaitError::TimedOut {
                    ceiling: self.max_wait,
                    waited,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::MonitorSettings;
    use crate::infrastructure::mock_engine::MockPage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn watcher_with(probe: Arc<dyn WaitingRoomProbe>, settings: &QueueWaitSettings) -> QueueWaitWatcher {
        QueueWaitWatcher::new(probe, settings)
    }

    fn monitor() -> LiveMonitor {
        LiveMonitor::new("queue-wait", &MonitorSettings::default())
    }

    /// Probe that reports "waiting" for the first N checks.
    struct CountdownProbe {
        remaining: AtomicU32,
    }

    #[async_trait]
    impl WaitingRoomProbe for CountdownProbe {
        async fn check(&self, _page: &dyn PageHandle) -> anyhow::Result<WaitObservation> {
            let waiting = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(WaitObservation {
                waiting,
                position: None,
                estimated_wait: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_pass_returns_without_sleeping() {
        let probe = Arc::new(CountdownProbe {
            remaining: AtomicU32::new(0),
        });
        let watcher = watcher_with(probe, &QueueWaitSettings::default());
        let page = MockPage::new("https://shop.example/checkout");
        let monitor = monitor();

        let started = tokio::time::Instant::now();
        let outcome = watcher
            .wait_for_completion(&page, "s-1", &monitor)
            .await
            .expect("no timeout");

        assert_eq!(outcome, QueueWaitOutcome::NotEncountered);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(monitor.snapshot().await.stats.waiting_page_encounters, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn passes_after_polling_and_reports_the_wait() {
        let probe = Arc::new(CountdownProbe {
            remaining: AtomicU32::new(3),
        });
        let watcher = watcher_with(probe, &QueueWaitSettings::default());
        let page = MockPage::new("https://shop.example/waiting-room");
        let monitor = monitor();

        let outcome = watcher
            .wait_for_completion(&page, "s-1", &monitor)
            .await
            .expect("eventually passes");

        // default poll = 5s, waiting on checks 1..=3, passed on check 4
        assert_eq!(
            outcome,
            QueueWaitOutcome::Passed {
                waited: Duration::from_secs(15)
            }
        );
        let snap = monitor.snapshot().await;
        assert_eq!(snap.stats.waiting_page_encounters, 1);
        assert_eq!(snap.stats.avg_wait_time, 15_000);
    }

    #[tokio::test(start_paused = true)]
    async fn indefinite_waiting_times_out_at_the_ceiling() {
        let probe = Arc::new(CountdownProbe {
            remaining: AtomicU32::new(u32::MAX),
        });
        let settings = QueueWaitSettings::default();
        let watcher = watcher_with(probe, &settings);
        let page = MockPage::new("https://shop.example/waiting-room");
        let monitor = monitor();

        let started = tokio::time::Instant::now();
        let result = watcher.wait_for_completion(&page, "s-1", &monitor).await;

        let ceiling = Duration::from_secs(settings.max_wait_secs);
        let poll = Duration::from_secs(settings.default_poll_secs);
        assert!(matches!(result, Err(QueueWaitError::TimedOut { .. })));
        assert!(started.elapsed() >= ceiling);
        assert!(started.elapsed() <= ceiling + poll);
    }

    #[tokio::test(start_paused = true)]
    async fn server_estimate_caps_the_poll_interval() {
        /// Waiting once with a large estimate, then passed.
        struct EstimateProbe {
            first: AtomicU32,
        }

        #[async_trait]
        impl WaitingRoomProbe for EstimateProbe {
            async fn check(&self, _page: &dyn PageHandle) -> anyhow::Result<WaitObservation> {
                if self.first.swap(0, Ordering::SeqCst) == 1 {
                    Ok(WaitObservation {
                        waiting: true,
                        position: Some(1_000),
                        estimated_wait: Some(Duration::from_secs(600)),
                    })
                } else {
                    Ok(WaitObservation::default())
                }
            }
        }

        let watcher = watcher_with(
            Arc::new(EstimateProbe {
                first: AtomicU32::new(1),
            }),
            &QueueWaitSettings::default(),
        );
        let page = MockPage::new("https://shop.example/waiting-room");
        let monitor = monitor();

        let outcome = watcher
            .wait_for_completion(&page, "s-1", &monitor)
            .await
            .expect("passes on second check");

        // estimate 600s capped to max_poll 30s
        assert_eq!(
            outcome,
            QueueWaitOutcome::Passed {
                waited: Duration::from_secs(30)
            }
        );
    }

    #[tokio::test]
    async fn marker_probe_detects_url_and_parses_content() {
        let probe = MarkerProbe::from_settings(&QueueWaitSettings::default()).expect("compile");
        let page = MockPage::new("https://shop.example/waiting-room?id=9");
        page.set_content("You are now in the queue. Number in line: 1532. Estimated wait: 12 minutes.")
            .await;

        let observation = probe.check(&page).await.expect("probe");
        assert!(observation.waiting);
        assert_eq!(observation.position, Some(1532));
        assert_eq!(observation.estimated_wait, Some(Duration::from_secs(720)));
    }

    #[tokio::test]
    async fn marker_probe_detects_content_signature_on_plain_url() {
        let probe = MarkerProbe::from_settings(&QueueWaitSettings::default()).expect("compile");
        let page = MockPage::new("https://shop.example/event/7");
        page.set_content("Please hold on, you are in a queue. Estimated wait: 40 seconds.")
            .await;

        let observation = probe.check(&page).await.expect("probe");
        assert!(observation.waiting);
        assert_eq!(observation.estimated_wait, Some(Duration::from_secs(40)));
    }

    #[tokio::test]
    async fn marker_probe_ignores_normal_pages() {
        let probe = MarkerProbe::from_settings(&QueueWaitSettings::default()).expect("compile");
        let page = MockPage::new("https://shop.example/checkout");
        page.set_content("<h1>Checkout</h1>").await;

        let observation = probe.check(&page).await.expect("probe");
        assert!(!observation.waiting);
    }
}
