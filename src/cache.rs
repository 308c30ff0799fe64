use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::driver::{self, TimerHint};
use crate::entry::{EvictionReason, Item, Ttl};
use crate::index::{EntryIndex, Upsert};
use crate::loader::Loader;
use crate::metrics::Metrics;
use crate::registry::{isolate, Registry, Subscription};
use crate::Error;

type InsertionFn<K, V> = dyn Fn(&Item<K, V>) + Send + Sync;
type EvictionFn<K, V> = dyn Fn(EvictionReason, &Item<K, V>) + Send + Sync;

/// Configures and builds a [`Cache`].
///
/// ```
/// use perishable::Cache;
/// use std::time::Duration;
///
/// let cache: Cache<String, u32> = Cache::builder()
///     .capacity(1024)
///     .default_ttl(Duration::from_secs(30))
///     .build();
/// cache.insert("answer".to_string(), 42).unwrap();
/// assert_eq!(cache.len(), 1);
/// ```
pub struct CacheBuilder<K, V> {
    capacity: usize,
    default_ttl: Option<Duration>,
    touch_on_hit: bool,
    loader: Option<Arc<dyn Loader<K, V>>>,
}

impl<K, V> Default for CacheBuilder<K, V> {
    fn default() -> Self {
        CacheBuilder {
            capacity: 0,
            default_ttl: None,
            touch_on_hit: true,
            loader: None,
        }
    }
}

impl<K, V> CacheBuilder<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum entry count before inserts displace the LRU back.
    /// Zero (the default) means unbounded.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// TTL applied by inserts that pass [`Ttl::Default`].
    /// A zero duration means entries never expire, which is also the default.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    /// Whether a hit re-arms the entry's expiry at `now + ttl`.
    /// Enabled by default.
    pub fn touch_on_hit(mut self, touch: bool) -> Self {
        self.touch_on_hit = touch;
        self
    }

    /// Miss handler invoked by [`Cache::get`]; see [`Loader`].
    pub fn loader(mut self, loader: impl Loader<K, V> + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn build(self) -> Cache<K, V> {
        Cache {
            shared: Arc::new(Shared {
                index: RwLock::new(EntryIndex::new(self.capacity)),
                metrics: RwLock::new(Metrics::default()),
                insertion: Arc::new(Registry::new()),
                eviction: Arc::new(Registry::new()),
                timer: Arc::new(TimerHint::new()),
                worker: Mutex::new(None),
                default_ttl: self.default_ttl,
                touch_on_hit: self.touch_on_hit,
                loader: self.loader,
            }),
        }
    }
}

/// In-process key/value cache with per-entry TTL and LRU capacity eviction.
///
/// `Cache` is a cheap handle: clones share one underlying cache and it is
/// safe to use from many threads at once. Expired entries stop being
/// returned immediately, but are only reclaimed by the expiration driver
/// ([`start`](Cache::start)) or an explicit
/// [`evict_expired`](Cache::evict_expired) sweep.
pub struct Cache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Cache {
            shared: self.shared.clone(),
        }
    }
}

pub(crate) struct Shared<K, V> {
    index: RwLock<EntryIndex<K, V>>,
    metrics: RwLock<Metrics>,
    insertion: Arc<Registry<InsertionFn<K, V>>>,
    eviction: Arc<Registry<EvictionFn<K, V>>>,
    timer: Arc<TimerHint>,
    worker: Mutex<Option<JoinHandle<()>>>,
    default_ttl: Option<Duration>,
    touch_on_hit: bool,
    loader: Option<Arc<dyn Loader<K, V>>>,
}

impl<K, V> Drop for Shared<K, V> {
    fn drop(&mut self) {
        // the driver thread only holds the mailbox and a weak handle;
        // flagging the mailbox lets it unwind once the last cache is gone
        self.timer.halt();
    }
}

/// Observer notification queued under the index lock, delivered after it
/// is released.
pub(crate) enum Event<K, V> {
    Inserted(Item<K, V>),
    Evicted(EvictionReason, Item<K, V>),
}

impl<K, V> Shared<K, V> {
    pub(crate) fn deliver(&self, events: Vec<Event<K, V>>) {
        for event in &events {
            match event {
                Event::Inserted(item) => {
                    for callback in self.insertion.snapshot() {
                        isolate(|| (*callback)(item));
                    }
                }
                Event::Evicted(reason, item) => {
                    for callback in self.eviction.snapshot() {
                        isolate(|| (*callback)(*reason, item));
                    }
                }
            }
        }
    }
}

impl<K: Eq + Hash, V> Shared<K, V> {
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.index.read().next_expiry()
    }

    /// Reap everything expired at `now`. Returns the queued eviction events
    /// and the new earliest expiry; the caller delivers the events with no
    /// lock held.
    pub(crate) fn sweep(&self, now: Instant) -> (Vec<Event<K, V>>, Option<Instant>) {
        let mut index = self.index.write();
        let reaped = index.pop_expired(now);
        let next = index.next_expiry();
        if !reaped.is_empty() {
            self.metrics.write().evictions += reaped.len() as u64;
        }
        drop(index);
        let events = reaped
            .into_iter()
            .map(|entry| Event::Evicted(EvictionReason::Expired, entry.into_item()))
            .collect();
        (events, next)
    }

    fn resolve_ttl(&self, ttl: Ttl) -> Option<Duration> {
        match ttl {
            Ttl::Default => self.default_ttl,
            Ttl::Never => None,
            Ttl::After(d) => (!d.is_zero()).then_some(d),
        }
    }
}

impl<K, V> Cache<K, V> {
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder::new()
    }

    /// An unbounded cache with no default TTL.
    pub fn new() -> Self {
        CacheBuilder::new().build()
    }
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    /// Insert `key` with the cache's default TTL. See [`insert_ttl`](Cache::insert_ttl).
    pub fn insert(&self, key: K, value: V) -> Result<Item<K, V>, Error> {
        self.insert_ttl(key, value, Ttl::Default)
    }

    /// Insert or update `key` and return a snapshot of the stored entry.
    ///
    /// A new key counts as an insertion and notifies insertion observers;
    /// updating an existing key does neither. When the cache is at
    /// capacity, the least recently used entry is evicted with
    /// [`EvictionReason::CapacityReached`] to make room first, so the new
    /// entry is never its own victim. Either way the entry ends up at the
    /// recency front.
    pub fn insert_ttl(&self, key: K, value: V, ttl: Ttl) -> Result<Item<K, V>, Error> {
        let ttl = self.shared.resolve_ttl(ttl);
        let now = Instant::now();
        let expires_at = match ttl {
            Some(ttl) => Some(now.checked_add(ttl).ok_or(Error::TimeBounds)?),
            None => None,
        };

        let mut events = Vec::new();
        let item;
        {
            let mut index = self.shared.index.write();
            let head_before = index.next_expiry();
            let (outcome, victim) = index.upsert(key, value, ttl, expires_at);
            item = index.entry(outcome.slot()).snapshot();

            let inserted = matches!(outcome, Upsert::Inserted(_));
            {
                let mut metrics = self.shared.metrics.write();
                if inserted {
                    metrics.insertions += 1;
                }
                if victim.is_some() {
                    metrics.evictions += 1;
                }
            }
            if let Some(victim) = victim {
                events.push(Event::Evicted(
                    EvictionReason::CapacityReached,
                    victim.into_item(),
                ));
            }
            if inserted {
                events.push(Event::Inserted(item.clone()));
            }
            self.hint_if_changed(&index, head_before);
        }
        self.shared.deliver(events);
        Ok(item)
    }

    /// Look up `key`.
    ///
    /// A hit moves the entry to the recency front and, unless
    /// [`touch_on_hit`](CacheBuilder::touch_on_hit) is disabled, re-arms its
    /// expiry. A miss — including a present-but-expired entry — falls
    /// through to the configured [`Loader`], whose result is returned as-is.
    /// Expired entries are left for the driver to reap.
    pub fn get(&self, key: &K) -> Option<Item<K, V>> {
        let now = Instant::now();
        let mut found = None;
        {
            let mut index = self.shared.index.write();
            if let Some(slot) = index.slot_of(key) {
                if !index.entry(slot).is_expired(now) {
                    index.promote(slot);
                    if self.shared.touch_on_hit {
                        let head_before = index.next_expiry();
                        index.extend(slot, now);
                        self.hint_if_changed(&index, head_before);
                    }
                    found = Some(index.entry(slot).snapshot());
                }
            }
        }

        match found {
            Some(item) => {
                self.shared.metrics.write().hits += 1;
                Some(item)
            }
            None => {
                self.shared.metrics.write().misses += 1;
                match &self.shared.loader {
                    Some(loader) => loader.load(self, key),
                    None => None,
                }
            }
        }
    }

    /// Fetch `key`, or store the closure's value under it and return that.
    ///
    /// One write-lock round trip: the hit path behaves like [`get`](Cache::get)
    /// (minus the loader), the miss path like [`insert_ttl`](Cache::insert_ttl).
    /// `make` runs under the cache's write lock and must not reenter the
    /// cache.
    pub fn get_or_insert_with(
        &self,
        key: K,
        ttl: Ttl,
        make: impl FnOnce() -> V,
    ) -> Result<Item<K, V>, Error> {
        let now = Instant::now();
        let mut events = Vec::new();
        let item;
        {
            let mut index = self.shared.index.write();
            if let Some(slot) = index.slot_of(&key) {
                if !index.entry(slot).is_expired(now) {
                    index.promote(slot);
                    if self.shared.touch_on_hit {
                        let head_before = index.next_expiry();
                        index.extend(slot, now);
                        self.hint_if_changed(&index, head_before);
                    }
                    let item = index.entry(slot).snapshot();
                    drop(index);
                    self.shared.metrics.write().hits += 1;
                    return Ok(item);
                }
            }

            let ttl = self.shared.resolve_ttl(ttl);
            let expires_at = match ttl {
                Some(ttl) => Some(now.checked_add(ttl).ok_or(Error::TimeBounds)?),
                None => None,
            };
            let head_before = index.next_expiry();
            let (outcome, victim) = index.upsert(key, make(), ttl, expires_at);
            item = index.entry(outcome.slot()).snapshot();

            let inserted = matches!(outcome, Upsert::Inserted(_));
            {
                let mut metrics = self.shared.metrics.write();
                metrics.misses += 1;
                if inserted {
                    metrics.insertions += 1;
                }
                if victim.is_some() {
                    metrics.evictions += 1;
                }
            }
            if let Some(victim) = victim {
                events.push(Event::Evicted(
                    EvictionReason::CapacityReached,
                    victim.into_item(),
                ));
            }
            if inserted {
                events.push(Event::Inserted(item.clone()));
            }
            self.hint_if_changed(&index, head_before);
        }
        self.shared.deliver(events);
        Ok(item)
    }

    /// Remove `key` and return its snapshot. Observers still see a
    /// [`EvictionReason::Deleted`] eviction.
    pub fn get_and_remove(&self, key: &K) -> Option<Item<K, V>> {
        let mut events = Vec::new();
        let removed;
        {
            let mut index = self.shared.index.write();
            removed = index.remove(key).map(|entry| entry.into_item());
            if let Some(item) = &removed {
                self.shared.metrics.write().evictions += 1;
                events.push(Event::Evicted(EvictionReason::Deleted, item.clone()));
            }
        }
        self.shared.deliver(events);
        removed
    }

    /// A decoupled copy of the whole mapping; iteration never contends with
    /// concurrent mutators.
    pub fn items(&self) -> HashMap<K, Item<K, V>>
    where
        K: Clone,
    {
        self.shared
            .index
            .read()
            .iter()
            .map(|entry| (entry.key().clone(), entry.snapshot()))
            .collect()
    }
}

impl<K: Eq + Hash, V> Cache<K, V> {
    /// Remove `key`, notifying eviction observers with
    /// [`EvictionReason::Deleted`]. Missing keys are a no-op.
    pub fn remove(&self, key: &K) {
        let mut events = Vec::new();
        {
            let mut index = self.shared.index.write();
            if let Some(entry) = index.remove(key) {
                self.shared.metrics.write().evictions += 1;
                events.push(Event::Evicted(EvictionReason::Deleted, entry.into_item()));
            }
        }
        self.shared.deliver(events);
    }

    /// Remove every entry, notifying observers with
    /// [`EvictionReason::Deleted`] per entry.
    pub fn clear(&self) {
        let mut events = Vec::new();
        {
            let mut index = self.shared.index.write();
            let drained = index.take_all();
            if !drained.is_empty() {
                self.shared.metrics.write().evictions += drained.len() as u64;
            }
            events.extend(
                drained
                    .into_iter()
                    .map(|entry| Event::Evicted(EvictionReason::Deleted, entry.into_item())),
            );
        }
        self.shared.deliver(events);
    }

    /// Reap every entry whose expiry has passed, with
    /// [`EvictionReason::Expired`]. The manual counterpart of the driver's
    /// sweep, for caches running without [`start`](Cache::start).
    pub fn evict_expired(&self) {
        let (events, _) = self.shared.sweep(Instant::now());
        self.shared.deliver(events);
    }

    /// Re-arm `key`'s expiry at `now + ttl` and move it to the recency
    /// front. Missing keys are a no-op.
    pub fn touch(&self, key: &K) {
        let now = Instant::now();
        let mut index = self.shared.index.write();
        if let Some(slot) = index.slot_of(key) {
            index.promote(slot);
            let head_before = index.next_expiry();
            index.extend(slot, now);
            self.hint_if_changed(&index, head_before);
        }
    }

    /// Whether `key` holds a live (unexpired) entry. Does not affect
    /// recency, expiry, or metrics.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = Instant::now();
        let index = self.shared.index.read();
        index
            .slot_of(key)
            .is_some_and(|slot| !index.entry(slot).is_expired(now))
    }

    pub fn len(&self) -> usize {
        self.shared.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used. Unreaped expired entries are
    /// included.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.shared
            .index
            .read()
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn metrics(&self) -> Metrics {
        self.shared.metrics.read().clone()
    }

    /// Push a wake hint when this mutation changed the earliest expiry.
    fn hint_if_changed(&self, index: &EntryIndex<K, V>, head_before: Option<Instant>) {
        let head = index.next_expiry();
        if head != head_before {
            if let Some(at) = head {
                self.shared.timer.propose(at);
            }
        }
    }
}

impl<K: 'static, V: 'static> Cache<K, V> {
    /// Register an insertion observer. Observers run after the insert is
    /// visible, with no cache lock held; a panicking observer is contained.
    pub fn on_insertion(&self, f: impl Fn(&Item<K, V>) + Send + Sync + 'static) -> Subscription {
        let callback: Arc<InsertionFn<K, V>> = Arc::new(f);
        let id = self.shared.insertion.register(callback);
        let registry = Arc::downgrade(&self.shared.insertion);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.deregister(id);
            }
        })
    }

    /// Register an eviction observer; it receives the reason alongside the
    /// evicted entry. Same delivery rules as [`on_insertion`](Cache::on_insertion).
    pub fn on_eviction(
        &self,
        f: impl Fn(EvictionReason, &Item<K, V>) + Send + Sync + 'static,
    ) -> Subscription {
        let callback: Arc<EvictionFn<K, V>> = Arc::new(f);
        let id = self.shared.eviction.register(callback);
        let registry = Arc::downgrade(&self.shared.eviction);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.deregister(id);
            }
        })
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Spawn the expiration driver. A no-op when it is already running.
    pub fn start(&self) {
        let mut worker = self.shared.worker.lock();
        if worker.is_some() {
            return;
        }
        self.shared.timer.resume();
        let weak: Weak<Shared<K, V>> = Arc::downgrade(&self.shared);
        let hint = self.shared.timer.clone();
        let handle = thread::Builder::new()
            .name("perishable-expiry".to_string())
            .spawn(move || driver::run(weak, hint))
            .expect("failed to spawn the expiration driver thread");
        *worker = Some(handle);
    }

    /// Stop the expiration driver and wait for it to finish, including any
    /// callback delivery already in flight. Idempotent; the driver can be
    /// started again afterwards.
    pub fn stop(&self) {
        let mut worker = self.shared.worker.lock();
        self.shared.timer.halt();
        if let Some(handle) = worker.take() {
            // an eviction observer may call stop from the driver itself;
            // the flagged mailbox already guarantees the loop unwinds
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl<K: Eq + Hash, V> fmt::Debug for Cache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
