//! A keyed cache for values which are fetched by async functions on the
//! tokio runtime.
//!
//! Concurrent misses for the same key are coalesced: only one fill runs,
//! and every waiter receives an echo of its result.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};

mod sweeper;

pub use sweeper::Sweeper;

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

/// A future resolving to the result of an inflight fill.
pub struct Handle<T> {
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(mut reciever: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { reciever.recv().await }),
        }
    }

    fn ready(value: T) -> Self {
        Self {
            fut: Box::pin(futures::future::ready(Ok(value))),
        }
    }
}

struct CacheInner<K, V> {
    entries: RwLock<HashMap<K, V>>,
    inflight: Mutex<HashMap<K, Weak<broadcast::Sender<Option<V>>>>>,

    /// Bumped on every clear, so that fills which started before a clear
    /// never repopulate the cache with what may now be stale data.
    generation: AtomicU64,
}

impl<K, V> fmt::Debug for CacheInner<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInner")
            .field("entries", &self.entries.read().len())
            .field("inflight", &self.inflight.lock().len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

/// A keyed cache whose entries live until the cache is cleared.
///
/// Fill functions return `None` when their result should not be remembered
/// (for example, when the backing store failed). Waiters still receive the `None`.
#[derive(Debug)]
pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached value without filling.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.entries.read().get(key).cloned()
    }

    /// Store a value directly.
    pub fn insert(&self, key: K, value: V) {
        self.inner.entries.write().insert(key, value);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Drop every cached entry. Fills which are already running will still
    /// answer their waiters, but will not be stored.
    pub fn clear(&self) {
        let mut entries = self.inner.entries.write();
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = entries.len();
        entries.clear();
        tracing::trace!(dropped, "Cleared cache");
    }

    /// Get a handle to the cached value for `key`, or to the one-and-only
    /// inflight fill for that key.
    pub fn handle<F>(&self, key: K, fill: F) -> Handle<Option<V>>
    where
        F: FnOnce() -> BoxFut<'static, Option<V>>,
    {
        if let Some(value) = self.get(&key) {
            return Handle::ready(Some(value));
        }

        // Hold the inflight lock so that no other caller can start the same fill.
        let mut inflight = self.inner.inflight.lock();
        if let Some(tx) = inflight.get(&key).and_then(Weak::upgrade) {
            tracing::trace!("Found inflight request");
            return Handle::new(tx.subscribe());
        }

        // A fill may have finished between the lookup above and taking the lock.
        if let Some(value) = self.get(&key) {
            return Handle::ready(Some(value));
        }

        let (tx, rx) = broadcast::channel::<Option<V>>(1);
        let tx = Arc::new(tx);
        inflight.insert(key.clone(), Arc::downgrade(&tx));

        let generation = self.inner.generation.load(Ordering::Acquire);
        let fut = (fill)();
        let inner = Arc::clone(&self.inner);

        tracing::trace!("Launching new request");
        tokio::spawn(async move {
            let value = fut.await;

            // Hold the inflight lock while responding, so no subscriber can
            // join after the send and miss the answer.
            let mut inflight = inner.inflight.lock();
            inflight.remove(&key);
            if let Some(value) = &value {
                let mut entries = inner.entries.write();
                if inner.generation.load(Ordering::Acquire) == generation {
                    entries.insert(key, value.clone());
                }
            }
            let _ = tx.send(value);
        });

        Handle::new(rx)
    }

    /// Return the cached value for `key`, filling it if it is missing.
    pub async fn get_or_fill<F>(&self, key: K, fill: F) -> Result<Option<V>, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, Option<V>>,
    {
        self.handle(key, fill).await
    }

    /// Spawn a background task which clears this cache every `period`.
    ///
    /// The task stops when the returned [`Sweeper`] is dropped, or once every
    /// handle to the cache is gone.
    pub fn sweep_every(&self, period: Duration) -> Sweeper {
        let cache: Weak<CacheInner<K, V>> = Arc::downgrade(&self.inner);
        Sweeper::every(period, move || match cache.upgrade() {
            Some(inner) => {
                Cache { inner }.clear();
                true
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_fill(
        counter: &Arc<AtomicUsize>,
        value: Option<u32>,
    ) -> impl FnOnce() -> BoxFut<'static, Option<u32>> {
        let counter = Arc::clone(counter);
        move || {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                value
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_coalesce() {
        let cache: Cache<&'static str, u32> = Cache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get_or_fill("key", counting_fill(&counter, Some(7))),
            cache.get_or_fill("key", counting_fill(&counter, Some(8))),
        );

        assert_eq!(a.unwrap(), Some(7));
        assert_eq!(b.unwrap(), Some(7));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"key"), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn hits_skip_fill() {
        let cache: Cache<&'static str, u32> = Cache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        cache.insert("key", 1);

        let value = cache
            .get_or_fill("key", counting_fill(&counter, Some(2)))
            .await
            .unwrap();
        assert_eq!(value, Some(1));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn none_is_not_remembered() {
        let cache: Cache<&'static str, u32> = Cache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let value = cache
            .get_or_fill("key", counting_fill(&counter, None))
            .await
            .unwrap();
        assert_eq!(value, None);
        assert!(cache.is_empty());

        cache
            .get_or_fill("key", counting_fill(&counter, None))
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_during_fill_discards_result() {
        let cache: Cache<&'static str, u32> = Cache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = cache.handle("key", counting_fill(&counter, Some(3)));
        cache.clear();
        assert_eq!(handle.await.unwrap(), Some(3));
        assert!(cache.get(&"key").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_clears_periodically() {
        let cache: Cache<&'static str, u32> = Cache::new();
        cache.insert("key", 1);

        let _sweeper = cache.sweep_every(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cache.len(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(cache.is_empty());
    }
}
