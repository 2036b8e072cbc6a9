//! LRU+TTL pool of outbound channels to endorsing nodes.
//!
//! Design goals:
//!
//! 1. **Reuse**: one channel per [`ChannelKey`], shared by every identity and client
//!    connection that targets the same node. Channels are transport-level only.
//!
//! 2. **Single flight**: concurrent acquisitions of a key wait on the same
//!    construction instead of racing to build several channels.
//!
//! 3. **Bounded**: a maximum entry count (least recently used goes first) and a
//!    maximum age measured from creation. Every evicted channel is handed to
//!    [`ChannelFactory::release`] exactly once.
//!
//! 4. **Testable time**: uses the `TimeSource` trait for deterministic testing.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::{ChannelFactory, ChannelKey, ConnectError};
use crate::util::time_source::{InstantTimeSrc, TimeSource};

/// Default maximum number of pooled channels.
pub const DEFAULT_MAX_ENTRIES: usize = 32;

/// Default maximum lifetime of a pooled channel (10 minutes).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_age: Duration,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Channel under construction or ready. Shared between the table and the callers
/// waiting for the construction to finish.
struct Slot<C> {
    channel: OnceCell<C>,
    released: AtomicBool,
}

struct CacheEntry<C> {
    slot: Arc<Slot<C>>,
    created_at: Instant,
}

struct CacheTable<C> {
    /// LRU order - front is oldest, back is newest
    lru_order: VecDeque<ChannelKey>,
    entries: HashMap<ChannelKey, CacheEntry<C>>,
}

type Evicted<C> = Vec<(ChannelKey, Arc<Slot<C>>)>;

enum BuildError {
    /// The slot left the table before its construction started.
    Stale,
    Connect(ConnectError),
}

impl<C> CacheTable<C> {
    fn remove(&mut self, key: &ChannelKey) -> Option<CacheEntry<C>> {
        let entry = self.entries.remove(key)?;
        self.lru_order.retain(|k| k != key);
        Some(entry)
    }

    fn evict_expired(&mut self, now: Instant, max_age: Duration) -> Evicted<C> {
        let expired: Vec<ChannelKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) > max_age)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                let entry = self.remove(&key)?;
                Some((key, entry.slot))
            })
            .collect()
    }

    fn evict_over_capacity(&mut self, max_entries: usize) -> Evicted<C> {
        let mut evicted = Vec::new();
        while self.entries.len() > max_entries {
            let Some(oldest) = self.lru_order.pop_front() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                evicted.push((oldest, entry.slot));
            }
        }
        evicted
    }

    fn drain(&mut self) -> Evicted<C> {
        self.lru_order.clear();
        self.entries
            .drain()
            .map(|(key, entry)| (key, entry.slot))
            .collect()
    }

    fn is_live(&self, key: &ChannelKey, slot: &Arc<Slot<C>>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.slot, slot))
    }
}

/// Process-wide pool of outbound channels.
pub struct ConnectionCache<F: ChannelFactory, T: TimeSource = InstantTimeSrc> {
    factory: F,
    limits: CacheLimits,
    table: Mutex<CacheTable<F::Channel>>,
    time_source: T,
}

impl<F: ChannelFactory> ConnectionCache<F> {
    pub fn new(factory: F, limits: CacheLimits) -> Self {
        Self::with_time_source(factory, limits, InstantTimeSrc::new())
    }
}

impl<F, T> ConnectionCache<F, T>
where
    F: ChannelFactory,
    T: TimeSource + Send + Sync,
{
    pub fn with_time_source(factory: F, limits: CacheLimits, time_source: T) -> Self {
        Self {
            factory,
            limits,
            table: Mutex::new(CacheTable {
                lru_order: VecDeque::new(),
                entries: HashMap::new(),
            }),
            time_source,
        }
    }

    /// Returns the pooled channel for `key`, building it if needed.
    ///
    /// Expired entries are evicted first; inserting a new entry evicts the least
    /// recently used ones past capacity. A failed construction leaves no entry behind
    /// so the next caller tries again. Callers that were waiting on the failed
    /// construction start over from the table instead of building on the dropped slot.
    pub async fn acquire(&self, key: &ChannelKey) -> Result<F::Channel, ConnectError> {
        loop {
            let (slot, evicted) = self.checkout(key);
            self.release_evicted(evicted);

            let built = slot
                .channel
                .get_or_try_init(|| self.build(key, &slot))
                .await
                .cloned();

            match built {
                Ok(channel) => {
                    // evicted while it was being built, nobody else will release it
                    let live = self.table.lock().is_live(key, &slot);
                    if !live {
                        self.release_slot(key, &slot);
                    }
                    return Ok(channel);
                }
                Err(BuildError::Stale) => {
                    tracing::trace!(%key, "slot dropped while waiting, retrying");
                }
                Err(BuildError::Connect(err)) => {
                    tracing::warn!(%key, error = %err, "failed opening channel to endorsing node");
                    return Err(err);
                }
            }
        }
    }

    /// Finds or inserts the slot for `key` and refreshes its LRU position.
    fn checkout(&self, key: &ChannelKey) -> (Arc<Slot<F::Channel>>, Evicted<F::Channel>) {
        let now = self.time_source.now();
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let mut evicted = table.evict_expired(now, self.limits.max_age);
        let slot = match table.entries.get(key) {
            Some(entry) => {
                let slot = entry.slot.clone();
                table.lru_order.retain(|k| k != key);
                table.lru_order.push_back(key.clone());
                slot
            }
            None => {
                let slot = Arc::new(Slot {
                    channel: OnceCell::new(),
                    released: AtomicBool::new(false),
                });
                table.entries.insert(
                    key.clone(),
                    CacheEntry {
                        slot: slot.clone(),
                        created_at: now,
                    },
                );
                table.lru_order.push_back(key.clone());
                evicted.extend(table.evict_over_capacity(self.limits.max_entries));
                slot
            }
        };
        (slot, evicted)
    }

    /// Runs while holding the slot's init permit. A failure removes the entry before
    /// the permit is handed to the next waiter.
    async fn build(
        &self,
        key: &ChannelKey,
        slot: &Arc<Slot<F::Channel>>,
    ) -> Result<F::Channel, BuildError> {
        let live = self.table.lock().is_live(key, slot);
        if !live {
            return Err(BuildError::Stale);
        }
        tracing::debug!(%key, "opening channel to endorsing node");
        match self.factory.connect(key).await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                self.forget(key, slot);
                Err(BuildError::Connect(err))
            }
        }
    }

    /// Evicts entries older than the maximum age. Returns how many were evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = self.time_source.now();
        let evicted = self.table.lock().evict_expired(now, self.limits.max_age);
        let count = evicted.len();
        self.release_evicted(evicted);
        count
    }

    /// Releases every pooled channel. Used on process shutdown.
    pub fn close_all(&self) {
        let evicted = self.table.lock().drain();
        tracing::debug!(channels = evicted.len(), "releasing all pooled channels");
        self.release_evicted(evicted);
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.table.lock().entries.contains_key(key)
    }

    fn forget(&self, key: &ChannelKey, slot: &Arc<Slot<F::Channel>>) {
        let mut table = self.table.lock();
        if table.is_live(key, slot) {
            table.remove(key);
        }
    }

    fn release_evicted(&self, evicted: Evicted<F::Channel>) {
        for (key, slot) in evicted {
            tracing::debug!(%key, "evicting pooled channel");
            self.release_slot(&key, &slot);
        }
    }

    /// Hands the channel to the factory unless it was already released. Slots still
    /// under construction are released by the constructing caller once it finishes.
    fn release_slot(&self, key: &ChannelKey, slot: &Slot<F::Channel>) {
        if let Some(channel) = slot.channel.get() {
            if !slot.released.swap(true, Ordering::SeqCst) {
                self.factory.release(key, channel.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::time_source::SharedMockTimeSource;
    use futures::{future::BoxFuture, FutureExt};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingFactory {
        built: AtomicUsize,
        released: Mutex<Vec<(ChannelKey, usize)>>,
        fail: AtomicBool,
        fail_next: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ChannelFactory for Arc<CountingFactory> {
        type Channel = usize;

        fn connect<'a>(
            &'a self,
            key: &'a ChannelKey,
        ) -> BoxFuture<'a, Result<usize, ConnectError>> {
            async move {
                let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                let fail_now = self.fail_next.swap(false, Ordering::SeqCst);
                if fail_now || self.fail.load(Ordering::SeqCst) {
                    return Err(ConnectError::InvalidEndpoint {
                        endpoint: key.endpoint.clone(),
                        cause: "refused".to_owned(),
                    });
                }
                Ok(self.built.fetch_add(1, Ordering::SeqCst) + 1)
            }
            .boxed()
        }

        fn release(&self, key: &ChannelKey, channel: usize) {
            self.released.lock().push((key.clone(), channel));
        }
    }

    fn key(n: u8) -> ChannelKey {
        ChannelKey {
            endpoint: format!("peer{n}:7051"),
            name: format!("peer{n}.org1.example.com"),
            trust_anchor: None,
        }
    }

    fn make_cache(
        max_entries: usize,
        max_age: Duration,
    ) -> (
        Arc<ConnectionCache<Arc<CountingFactory>, SharedMockTimeSource>>,
        Arc<CountingFactory>,
        SharedMockTimeSource,
    ) {
        let factory = Arc::new(CountingFactory::default());
        let time = SharedMockTimeSource::new();
        let cache = ConnectionCache::with_time_source(
            factory.clone(),
            CacheLimits {
                max_entries,
                max_age,
            },
            time.clone(),
        );
        (Arc::new(cache), factory, time)
    }

    #[tokio::test]
    async fn reuses_channel_for_same_key() {
        let (cache, factory, _) = make_cache(4, Duration::from_secs(60));

        let first = cache.acquire(&key(1)).await.unwrap();
        let second = cache.acquire(&key(1)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn trust_anchor_is_part_of_the_key() {
        let (cache, factory, _) = make_cache(4, Duration::from_secs(60));
        let plain = key(1);
        let tls = ChannelKey {
            trust_anchor: Some("-----BEGIN CERTIFICATE-----".to_owned()),
            ..key(1)
        };

        cache.acquire(&plain).await.unwrap();
        cache.acquire(&tls).await.unwrap();

        assert_eq!(factory.built.load(Ordering::SeqCst), 2);
        assert!(cache.contains(&plain) && cache.contains(&tls));
    }

    #[tokio::test]
    async fn concurrent_acquisitions_build_once() {
        let (cache, factory, _) = make_cache(4, Duration::from_secs(60));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.acquire(&key(7)).await.unwrap() })
            })
            .collect();
        let channels = futures::future::join_all(tasks).await;

        assert!(channels.iter().all(|ch| *ch.as_ref().unwrap() == 1));
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_past_capacity() {
        let (cache, factory, time) = make_cache(2, Duration::from_secs(600));

        cache.acquire(&key(1)).await.unwrap();
        time.advance_time(Duration::from_secs(1));
        cache.acquire(&key(2)).await.unwrap();
        time.advance_time(Duration::from_secs(1));
        // refresh key 1 so key 2 becomes the oldest
        cache.acquire(&key(1)).await.unwrap();
        cache.acquire(&key(3)).await.unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key(1)));
        assert!(!cache.contains(&key(2)));
        assert!(cache.contains(&key(3)));
        assert_eq!(*factory.released.lock(), vec![(key(2), 2)]);
    }

    #[tokio::test]
    async fn evicts_entries_past_max_age() {
        let (cache, factory, time) = make_cache(8, Duration::from_secs(60));

        cache.acquire(&key(1)).await.unwrap();
        cache.acquire(&key(2)).await.unwrap();
        time.advance_time(Duration::from_secs(61));

        // expired entry is rebuilt instead of reused
        let rebuilt = cache.acquire(&key(1)).await.unwrap();

        assert_eq!(rebuilt, 3);
        assert_eq!(cache.len(), 1);
        let mut released = factory.released.lock().clone();
        released.sort_by_key(|(_, ch)| *ch);
        assert_eq!(released, vec![(key(1), 1), (key(2), 2)]);
    }

    #[tokio::test]
    async fn sweep_releases_each_expired_entry_once() {
        let (cache, factory, time) = make_cache(8, Duration::from_secs(60));

        cache.acquire(&key(1)).await.unwrap();
        time.advance_time(Duration::from_secs(30));
        cache.acquire(&key(2)).await.unwrap();
        time.advance_time(Duration::from_secs(31));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.sweep_expired(), 0);
        assert_eq!(*factory.released.lock(), vec![(key(1), 1)]);
        assert!(cache.contains(&key(2)));
    }

    #[tokio::test]
    async fn failed_construction_leaves_no_entry() {
        let (cache, factory, _) = make_cache(4, Duration::from_secs(60));
        factory.fail.store(true, Ordering::SeqCst);

        assert!(cache.acquire(&key(1)).await.is_err());
        assert!(cache.is_empty());

        factory.fail.store(false, Ordering::SeqCst);
        assert_eq!(cache.acquire(&key(1)).await.unwrap(), 1);
        assert!(factory.released.lock().is_empty());
    }

    #[tokio::test]
    async fn waiters_on_a_failed_construction_do_not_build_in_parallel() {
        let (cache, factory, _) = make_cache(4, Duration::from_secs(60));
        factory.fail_next.store(true, Ordering::SeqCst);

        let failing = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire(&key(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // waits on the construction that is about to fail
        let waiting = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire(&key(1)).await })
        };

        assert!(failing.await.unwrap().is_err());
        let late = cache.acquire(&key(1)).await.unwrap();
        let waited = waiting.await.unwrap().unwrap();

        assert_eq!(waited, late);
        assert_eq!(factory.built.load(Ordering::SeqCst), 1);
        assert_eq!(factory.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(factory.released.lock().is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn entry_evicted_while_building_is_released_by_builder() {
        let (cache, factory, _) = make_cache(1, Duration::from_secs(60));

        let building = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire(&key(1)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // pushes key 1 out before its construction finished
        let second = cache.acquire(&key(2)).await.unwrap();
        let first = building.await.unwrap();

        assert_ne!(first, second);
        assert!(!cache.contains(&key(1)));
        assert_eq!(*factory.released.lock(), vec![(key(1), first)]);
    }

    #[tokio::test]
    async fn close_all_releases_everything() {
        let (cache, factory, _) = make_cache(8, Duration::from_secs(60));
        for n in 1..=3 {
            cache.acquire(&key(n)).await.unwrap();
        }

        cache.close_all();
        cache.close_all();

        assert!(cache.is_empty());
        assert_eq!(factory.released.lock().len(), 3);
    }
}
