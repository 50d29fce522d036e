//! Engine resource pool
//!
//! Owns a bounded set of engine instances, each hosting a bounded number
//! of sessions. Sessions are assigned by bin-packing on the admission
//! sequence number (`instance index = seq / capacity`), which guarantees
//! exactly ⌈N / capacity⌉ instances for N sessions and keeps memory
//! growth predictable. Instance and shared-context creation both go
//! through the single-flight guard, so concurrent demand for the same key
//! never launches twice.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::single_flight::SingleFlight;
use crate::infrastructure::config::{ContextMode, PoolSettings};
use crate::infrastructure::engine::{EngineInstance, EngineLauncher, ExecutionContext, PageHandle};

/// Pool-level failures. Cloneable so one launch failure can reach every
/// waiter on that key.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("engine launch failed for instance {index}: {message}")]
    LaunchFailed { index: usize, message: String },

    #[error("context creation failed on instance {index}: {message}")]
    ContextFailed { index: usize, message: String },

    #[error("page creation failed on instance {index}: {message}")]
    PageFailed { index: usize, message: String },

    #[error("instance {index} is over capacity ({capacity})")]
    CapacityExceeded { index: usize, capacity: usize },

    #[error("session '{0}' already holds pool resources")]
    AlreadyAcquired(String),

    #[error("pool has been shut down")]
    ShutDown,
}

/// What a session gets back from `acquire`.
///
/// `Debug` is implemented manually because the trait-object fields have no
/// `Debug` bound.
pub struct SessionResources {
    pub instance_index: usize,
    pub context: Arc<dyn ExecutionContext>,
    pub page: Arc<dyn PageHandle>,
}

impl std::fmt::Debug for SessionResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResources")
            .field("instance_index", &self.instance_index)
            .finish_non_exhaustive()
    }
}

struct PoolEntry {
    instance: Arc<dyn EngineInstance>,
    /// Present only in shared mode, created on first demand
    shared_context: Option<Arc<dyn ExecutionContext>>,
    assigned: HashSet<String>,
}

impl PoolEntry {
    fn new(instance: Arc<dyn EngineInstance>) -> Self {
        Self {
            instance,
            shared_context: None,
            assigned: HashSet::new(),
        }
    }
}

struct Assignment {
    index: usize,
    context: Arc<dyn ExecutionContext>,
    page: Arc<dyn PageHandle>,
}

/// Bounded pool of engine instances with lazy single-flight creation.
pub struct EnginePool {
    launcher: Arc<dyn EngineLauncher>,
    settings: PoolSettings,
    entries: RwLock<HashMap<usize, PoolEntry>>,
    assignments: RwLock<HashMap<String, Assignment>>,
    launch_guard: SingleFlight<usize, Arc<dyn EngineInstance>>,
    context_guard: SingleFlight<usize, Arc<dyn ExecutionContext>>,
    next_seq: AtomicUsize,
    shut_down: AtomicBool,
}

impl EnginePool {
    #[must_use]
    pub fn new(launcher: Arc<dyn EngineLauncher>, settings: PoolSettings) -> Self {
        let settings = PoolSettings {
            sessions_per_instance: settings.sessions_per_instance.max(1),
            ..settings
        };
        Self {
            launcher,
            settings,
            entries: RwLock::new(HashMap::new()),
            assignments: RwLock::new(HashMap::new()),
            launch_guard: SingleFlight::new(),
            context_guard: SingleFlight::new(),
            next_seq: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Sessions-per-instance capacity the pool was built with.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.settings.sessions_per_instance
    }

    /// Number of engine instances currently alive.
    pub async fn instance_count(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Acquires an execution context and page for `session_key`.
    ///
    /// Lazily launches the backing instance; concurrent requesters for the
    /// same instance share one launch attempt, and a failed launch reaches
    /// every one of them while clearing the guard for a later retry.
    pub async fn acquire(&self, session_key: &str) -> Result<SessionResources, PoolError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        if self.assignments.read().await.contains_key(session_key) {
            return Err(PoolError::AlreadyAcquired(session_key.to_string()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let index = seq / self.settings.sessions_per_instance;

        let instance = self.instance_for(index).await?;
        let (context, page) = match self.settings.context_mode {
            ContextMode::Isolated => {
                let context = instance
                    .new_context(&self.settings.context)
                    .await
                    .map_err(|e| PoolError::ContextFailed {
                        index,
                        message: e.to_string(),
                    })?;
                let page = match context.new_page().await {
                    Ok(page) => page,
                    Err(e) => {
                        if let Err(close_err) = context.close().await {
                            warn!("⚠️  context cleanup after page failure: {}", close_err);
                        }
                        return Err(PoolError::PageFailed {
                            index,
                            message: e.to_string(),
                        });
                    }
                };
                (context, page)
            }
            ContextMode::Shared => {
                let context = self.shared_context_for(index, &instance).await?;
                let page = context.new_page().await.map_err(|e| PoolError::PageFailed {
                    index,
                    message: e.to_string(),
                })?;
                (context, page)
            }
        };

        // Assignment and capacity accounting are atomic with respect to
        // other acquirers: both happen under the entries write lock.
        let admission = {
            let mut entries = self.entries.write().await;
            let capacity = self.settings.sessions_per_instance;
            match entries.get_mut(&index) {
                None => Err(PoolError::LaunchFailed {
                    index,
                    message: "instance disappeared during acquire".to_string(),
                }),
                Some(entry) if entry.assigned.len() >= capacity => {
                    Err(PoolError::CapacityExceeded { index, capacity })
                }
                Some(entry) => {
                    entry.assigned.insert(session_key.to_string());
                    Ok(())
                }
            }
        };
        if let Err(admit_err) = admission {
            // Don't leak what was just created for a session we won't seat.
            if let Err(e) = page.close().await {
                warn!("⚠️  page cleanup after refused admission: {}", e);
            }
            if matches!(self.settings.context_mode, ContextMode::Isolated) {
                if let Err(e) = context.close().await {
                    warn!("⚠️  context cleanup after refused admission: {}", e);
                }
            }
            return Err(admit_err);
        }

        self.assignments.write().await.insert(
            session_key.to_string(),
            Assignment {
                index,
                context: Arc::clone(&context),
                page: Arc::clone(&page),
            },
        );

        debug!("🔗 session '{}' assigned to instance {}", session_key, index);
        Ok(SessionResources {
            instance_index: index,
            context,
            page,
        })
    }

    /// Releases the resources held by `session_key`. Close failures are
    /// logged and swallowed; release never fails the caller.
    pub async fn release(&self, session_key: &str) {
        let Some(assignment) = self.assignments.write().await.remove(session_key) else {
            debug!("release for unknown session '{}', nothing to do", session_key);
            return;
        };

        if let Err(e) = assignment.page.close().await {
            warn!("⚠️  page close failed for '{}': {}", session_key, e);
        }
        if self.settings.context_mode == ContextMode::Isolated {
            if let Err(e) = assignment.context.close().await {
                warn!("⚠️  context close failed for '{}': {}", session_key, e);
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&assignment.index) {
            entry.assigned.remove(session_key);
        }
        debug!("🔓 session '{}' released from instance {}", session_key, assignment.index);
    }

    /// Closes all contexts, then all instances. Failures while closing are
    /// logged and never block the remaining teardown steps.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("🧹 shutting down engine pool");

        // Leftover per-session resources first.
        let assignments: Vec<(String, Assignment)> =
            self.assignments.write().await.drain().collect();
        for (session_key, assignment) in assignments {
            if let Err(e) = assignment.page.close().await {
                warn!("⚠️  page close failed for '{}' during shutdown: {}", session_key, e);
            }
            if self.settings.context_mode == ContextMode::Isolated {
                if let Err(e) = assignment.context.close().await {
                    warn!("⚠️  context close failed for '{}' during shutdown: {}", session_key, e);
                }
            }
        }

        let entries: Vec<(usize, PoolEntry)> = self.entries.write().await.drain().collect();

        for (index, entry) in &entries {
            if let Some(context) = &entry.shared_context {
                if let Err(e) = context.close().await {
                    warn!("⚠️  shared context close failed on instance {}: {}", index, e);
                }
            }
        }
        for (index, entry) in &entries {
            if let Err(e) = entry.instance.close().await {
                warn!("⚠️  instance {} close failed: {}", index, e);
            }
        }
        info!("✅ engine pool shut down ({} instances closed)", entries.len());
    }

    #[cfg(test)]
    async fn seat_phantom(&self, index: usize, key: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(&index) {
            entry.assigned.insert(key.to_string());
        }
    }

    async fn instance_for(&self, index: usize) -> Result<Arc<dyn EngineInstance>, PoolError> {
        if let Some(instance) = self
            .entries
            .read()
            .await
            .get(&index)
            .map(|e| Arc::clone(&e.instance))
        {
            return Ok(instance);
        }

        let launcher = Arc::clone(&self.launcher);
        let options = self.settings.launch.clone();
        let created = self
            .launch_guard
            .run(index, move || async move {
                info!("🚀 launching engine instance {}", index);
                launcher.launch(&options).await
            })
            .await
            .map_err(|e| PoolError::LaunchFailed {
                index,
                message: e.to_string(),
            })?;

        // Every waiter lands here; exactly one entry per key survives.
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(index)
            .or_insert_with(|| PoolEntry::new(Arc::clone(&created)));
        Ok(Arc::clone(&entry.instance))
    }

    async fn shared_context_for(
        &self,
        index: usize,
        instance: &Arc<dyn EngineInstance>,
    ) -> Result<Arc<dyn ExecutionContext>, PoolError> {
        if let Some(context) = self
            .entries
            .read()
            .await
            .get(&index)
            .and_then(|e| e.shared_context.as_ref().map(Arc::clone))
        {
            return Ok(context);
        }

        let instance = Arc::clone(instance);
        let options = self.settings.context.clone();
        let created = self
            .context_guard
            .run(index, move || async move { instance.new_context(&options).await })
            .await
            .map_err(|e| PoolError::ContextFailed {
                index,
                message: e.to_string(),
            })?;

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&index) else {
            return Err(PoolError::ContextFailed {
                index,
                message: "instance disappeared during context creation".to_string(),
            });
        };
        let context = entry
            .shared_context
            .get_or_insert_with(|| Arc::clone(&created));
        Ok(Arc::clone(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock_engine::MockEngine;
    use futures::future::join_all;

    fn pool_with(capacity: usize, mode: ContextMode) -> (Arc<EnginePool>, Arc<crate::infrastructure::mock_engine::MockEngineStats>) {
        let engine = MockEngine::new();
        let stats = engine.stats();
        let settings = PoolSettings {
            sessions_per_instance: capacity,
            context_mode: mode,
            ..PoolSettings::default()
        };
        (Arc::new(EnginePool::new(Arc::new(engine), settings)), stats)
    }

    #[tokio::test]
    async fn concurrent_burst_launches_exactly_ceil_n_over_c() {
        let (pool, stats) = pool_with(5, ContextMode::Isolated);

        let acquires = (0..12).map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&format!("s-{i}")).await })
        });
        let results = join_all(acquires).await;
        for result in results {
            assert!(result.expect("join").is_ok());
        }

        // ⌈12 / 5⌉ = 3, never more, even under simultaneous demand
        assert_eq!(stats.launches(), 3);
        assert_eq!(pool.instance_count().await, 3);
    }

    #[tokio::test]
    async fn shared_mode_reuses_one_context_per_instance() {
        // Scenario: 6 sessions, capacity 5, shared contexts
        let (pool, stats) = pool_with(5, ContextMode::Shared);

        for i in 0..6 {
            pool.acquire(&format!("s-{i}")).await.expect("acquire");
        }

        assert_eq!(stats.launches(), 2); // 5 + 1 sessions
        assert_eq!(stats.contexts_opened(), 2); // one shared context each
        assert_eq!(stats.pages_opened(), 6); // a page per session
    }

    #[tokio::test]
    async fn isolated_mode_opens_and_closes_a_context_per_session() {
        let (pool, stats) = pool_with(5, ContextMode::Isolated);

        pool.acquire("s-0").await.expect("acquire");
        pool.acquire("s-1").await.expect("acquire");
        assert_eq!(stats.contexts_opened(), 2);

        pool.release("s-0").await;
        assert_eq!(stats.contexts_closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stats.pages_closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_admission_closes_the_fresh_resources() {
        let (pool, stats) = pool_with(2, ContextMode::Isolated);

        pool.acquire("s-0").await.expect("acquire");
        // Fill the instance so the next acquirer targeting it is refused.
        pool.seat_phantom(0, "ghost").await;

        let err = pool.acquire("s-1").await.expect_err("over capacity");
        assert!(matches!(
            err,
            PoolError::CapacityExceeded { index: 0, capacity: 2 }
        ));
        // The page and context created for the refused session were closed.
        assert_eq!(stats.pages_closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(stats.contexts_closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn launch_failure_reaches_all_waiters_and_allows_retry() {
        let engine = MockEngine::new();
        engine.fail_next_launches(1);
        let stats = engine.stats();
        let settings = PoolSettings {
            sessions_per_instance: 8,
            ..PoolSettings::default()
        };
        let pool = Arc::new(EnginePool::new(Arc::new(engine), settings));

        let acquires = (0..4).map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&format!("s-{i}")).await })
        });
        let results: Vec<_> = join_all(acquires).await;
        let failures = results
            .into_iter()
            .map(|r| r.expect("join"))
            .filter(Result::is_err)
            .count();
        // At least the sessions sharing the failed launch fail; the guard
        // is cleared, so a fresh acquire succeeds.
        assert!(failures >= 1);

        let late = pool.acquire("s-late").await;
        assert!(late.is_ok());
        assert_eq!(stats.launches(), 1);
    }

    #[tokio::test]
    async fn duplicate_acquire_for_the_same_session_is_rejected() {
        let (pool, _stats) = pool_with(5, ContextMode::Isolated);
        pool.acquire("s-0").await.expect("first acquire");
        let second = pool.acquire("s-0").await;
        assert!(matches!(second, Err(PoolError::AlreadyAcquired(_))));
    }

    #[tokio::test]
    async fn shutdown_closes_contexts_then_instances_and_blocks_new_acquires() {
        let (pool, stats) = pool_with(3, ContextMode::Shared);
        for i in 0..4 {
            pool.acquire(&format!("s-{i}")).await.expect("acquire");
        }

        pool.shutdown().await;
        assert_eq!(stats.contexts_closed.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(stats.instances_closed.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(pool.instance_count().await, 0);

        let result = pool.acquire("s-late").await;
        assert!(matches!(result, Err(PoolError::ShutDown)));

        // idempotent
        pool.shutdown().await;
        assert_eq!(stats.instances_closed.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            /// For all N sessions and capacity C the pool creates exactly
            /// ⌈N/C⌉ instances, even under fully concurrent demand.
            #[test]
            fn instance_count_is_ceil_n_over_c(n in 1usize..40, capacity in 1usize..8) {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(2)
                    .enable_all()
                    .build()
                    .expect("runtime");
                runtime.block_on(async move {
                    let (pool, stats) = pool_with(capacity, ContextMode::Isolated);
                    let acquires = (0..n).map(|i| {
                        let pool = Arc::clone(&pool);
                        tokio::spawn(async move { pool.acquire(&format!("s-{i}")).await })
                    });
                    for result in join_all(acquires).await {
                        assert!(result.expect("join").is_ok());
                    }
                    assert_eq!(stats.launches(), n.div_ceil(capacity));
                });
            }
        }
    }
}
