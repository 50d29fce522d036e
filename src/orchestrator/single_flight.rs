//! Keyed single-flight guard
//!
//! Guarantees at most one in-flight creation per key: the first caller
//! starts the operation, concurrent callers for the same key await the
//! same shared future, and the guard entry is removed once the operation
//! settles (success or failure) so a later demand can retry.
//!
//! Removal is generation-tagged: a caller that awaited generation N never
//! evicts a newer generation that another caller started in the meantime.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Settled result shared by every waiter of one creation.
pub type SharedResult<V> = Result<V, Arc<anyhow::Error>>;

type InFlight<V> = Shared<BoxFuture<'static, SharedResult<V>>>;

struct Entry<V> {
    future: InFlight<V>,
    generation: u64,
}

struct State<K, V> {
    inflight: HashMap<K, Entry<V>>,
    next_generation: u64,
}

/// Generic single-flight primitive, keyed by resource id. Used for both
/// engine-instance and shared-context creation.
pub struct SingleFlight<K, V> {
    state: Mutex<State<K, V>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Clone + Eq + Hash + Send,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                inflight: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    /// Runs `create` for `key`, or joins the creation already in flight.
    ///
    /// Failures are propagated to every waiter; the guard entry is cleared
    /// either way so the next caller triggers a fresh attempt.
    pub async fn run<F, Fut>(&self, key: K, create: F) -> SharedResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let (future, generation) = {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.inflight.get(&key) {
                (entry.future.clone(), entry.generation)
            } else {
                state.next_generation += 1;
                let generation = state.next_generation;
                let future = create().map(|result| result.map_err(Arc::new)).boxed().shared();
                state.inflight.insert(
                    key.clone(),
                    Entry {
                        future: future.clone(),
                        generation,
                    },
                );
                (future, generation)
            }
        };

        let result = future.await;

        let mut state = self.state.lock().await;
        let settled_generation = state.inflight.get(&key).map(|e| e.generation);
        if settled_generation == Some(generation) {
            state.inflight.remove(&key);
        }

        result
    }

    /// Number of creations currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.inflight.len()
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Clone + Eq + Hash + Send,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_creation() {
        let guard = Arc::new(SingleFlight::<u32, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = Arc::clone(&guard);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                guard
                    .run(7, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.expect("join").expect("single-flight result");
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.in_flight().await, 0);
    }

    #[tokio::test]
    async fn failure_reaches_all_waiters_and_clears_the_guard() {
        let guard = Arc::new(SingleFlight::<&'static str, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let guard = Arc::clone(&guard);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                guard
                    .run("engine-0", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        anyhow::bail!("launch blew up")
                    })
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.expect("join");
            assert!(result.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Guard cleared: the next demand triggers a fresh attempt.
        let value = guard
            .run("engine-0", move || async move { Ok(9) })
            .await
            .expect("retry succeeds");
        assert_eq!(value, 9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_serialize() {
        let guard = Arc::new(SingleFlight::<u32, u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in 0..4u32 {
            let guard = Arc::clone(&guard);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                guard
                    .run(key, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(key * 10)
                    })
                    .await
            }));
        }

        for (key, handle) in (0..4u32).zip(handles) {
            assert_eq!(handle.await.expect("join").expect("value"), key * 10);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
