//! In-process mock automation engine
//!
//! Deterministic stand-in for a real engine driver. Counts every launch,
//! context and page operation, and can be scripted to fail the next N
//! launches or to add launch latency. Used by the sanity runner and by the
//! pool/scheduler tests.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::engine::{
    ContextOptions, EngineInstance, EngineLauncher, ExecutionContext, LaunchOptions, PageHandle,
};

/// Shared operation counters, readable from tests at any point.
#[derive(Debug, Default)]
pub struct MockEngineStats {
    pub launches: AtomicUsize,
    pub contexts_opened: AtomicUsize,
    pub pages_opened: AtomicUsize,
    pub instances_closed: AtomicUsize,
    pub contexts_closed: AtomicUsize,
    pub pages_closed: AtomicUsize,
}

impl MockEngineStats {
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn contexts_opened(&self) -> usize {
        self.contexts_opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }
}

/// Mock launcher. Clone the inner `stats` handle before handing the
/// launcher to the pool if you want to assert on counters afterwards.
pub struct MockEngine {
    stats: Arc<MockEngineStats>,
    fail_next_launches: AtomicUsize,
    launch_delay: Duration,
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MockEngineStats::default()),
            fail_next_launches: AtomicUsize::new(0),
            launch_delay: Duration::ZERO,
        }
    }

    /// Adds artificial latency to every launch (exercises single-flight).
    #[must_use]
    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    /// Scripts the next `count` launches to fail.
    pub fn fail_next_launches(&self, count: usize) {
        self.fail_next_launches.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stats(&self) -> Arc<MockEngineStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineLauncher for MockEngine {
    async fn launch(&self, _options: &LaunchOptions) -> anyhow::Result<Arc<dyn EngineInstance>> {
        if self.launch_delay > Duration::ZERO {
            tokio::time::sleep(self.launch_delay).await;
        }

        let remaining = self
            .fail_next_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            anyhow::bail!("mock engine: scripted launch failure");
        }

        let id = self.stats.launches.fetch_add(1, Ordering::SeqCst);
        debug!("🧪 mock engine instance {} launched", id);
        Ok(Arc::new(MockInstance {
            id,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockInstance {
    id: usize,
    stats: Arc<MockEngineStats>,
}

#[async_trait]
impl EngineInstance for MockInstance {
    async fn new_context(&self, _options: &ContextOptions) -> anyhow::Result<Arc<dyn ExecutionContext>> {
        self.stats.contexts_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockContext {
            instance_id: self.id,
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stats.instances_closed.fetch_add(1, Ordering::SeqCst);
        debug!("🧪 mock engine instance {} closed", self.id);
        Ok(())
    }
}

struct MockContext {
    instance_id: usize,
    stats: Arc<MockEngineStats>,
}

#[async_trait]
impl ExecutionContext for MockContext {
    async fn new_page(&self) -> anyhow::Result<Arc<dyn PageHandle>> {
        self.stats.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockPage::new(format!(
            "https://mock.local/instance/{}/page",
            self.instance_id
        ))))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.stats.contexts_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock page whose location and content can be rewritten by tests, which
/// is how waiting-room passage is simulated.
pub struct MockPage {
    url: RwLock<String>,
    content: RwLock<String>,
    closed: AtomicUsize,
}

impl MockPage {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: RwLock::new(url.into()),
            content: RwLock::new(String::new()),
            closed: AtomicUsize::new(0),
        }
    }

    pub async fn set_url(&self, url: impl Into<String>) {
        *self.url.write().await = url.into();
    }

    pub async fn set_content(&self, content: impl Into<String>) {
        *self.content.write().await = content.into();
    }
}

#[async_trait]
impl PageHandle for MockPage {
    async fn current_url(&self) -> anyhow::Result<String> {
        Ok(self.url.read().await.clone())
    }

    async fn content(&self) -> anyhow::Result<String> {
        Ok(self.content.read().await.clone())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_launch_failures_then_success() {
        let engine = MockEngine::new();
        engine.fail_next_launches(2);

        assert!(engine.launch(&LaunchOptions::default()).await.is_err());
        assert!(engine.launch(&LaunchOptions::default()).await.is_err());
        assert!(engine.launch(&LaunchOptions::default()).await.is_ok());
        assert_eq!(engine.stats().launches(), 1);
    }

    #[tokio::test]
    async fn counters_track_context_and_page_operations() {
        let engine = MockEngine::new();
        let stats = engine.stats();

        let instance = engine.launch(&LaunchOptions::default()).await.unwrap();
        let context = instance.new_context(&ContextOptions::default()).await.unwrap();
        let page = context.new_page().await.unwrap();

        assert_eq!(stats.contexts_opened(), 1);
        assert_eq!(stats.pages_opened(), 1);

        page.close().await.unwrap();
        context.close().await.unwrap();
        instance.close().await.unwrap();
        assert_eq!(stats.instances_closed.load(Ordering::SeqCst), 1);
    }
}
