use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wrap keys so they don't need to implement Clone: the key map and the
/// entry that owns the key share one allocation.
#[derive(Eq)]
pub(crate) struct CacheArc<T>(pub(crate) Arc<T>);

impl<T> CacheArc<T> {
    pub(crate) fn new(key: T) -> Self {
        CacheArc(Arc::new(key))
    }
}

impl<T> Clone for CacheArc<T> {
    fn clone(&self) -> Self {
        CacheArc(self.0.clone())
    }
}

impl<T: PartialEq> PartialEq for CacheArc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}

impl<T: Hash> Hash for CacheArc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> Borrow<T> for CacheArc<T> {
    fn borrow(&self) -> &T {
        &self.0
    }
}

/// Why an entry was removed from the cache, reported to eviction observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Removed explicitly (`remove`, `clear`, `get_and_remove`).
    Deleted,
    /// Displaced from the LRU back to make room for a new entry.
    CapacityReached,
    /// Reaped because its expiration time passed.
    Expired,
}

/// Time-to-live selector accepted by the insert family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    /// Use the cache's configured default TTL.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire this long after insertion. A zero duration means never.
    After(Duration),
}

/// An entry as owned by the cache. `heap_slot` caches the entry's position
/// in the expiry heap so removal stays O(log n); it is `None` exactly when
/// the entry has no expiration.
pub(crate) struct Entry<K, V> {
    pub(crate) key: CacheArc<K>,
    pub(crate) value: V,
    pub(crate) ttl: Option<Duration>,
    pub(crate) expires_at: Option<Instant>,
    pub(crate) heap_slot: Option<usize>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(
        key: CacheArc<K>,
        value: V,
        ttl: Option<Duration>,
        expires_at: Option<Instant>,
    ) -> Self {
        Entry {
            key,
            value,
            ttl,
            expires_at,
            heap_slot: None,
        }
    }

    pub(crate) fn key(&self) -> &K {
        &self.key.0
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    /// Snapshot the entry without disturbing it.
    pub(crate) fn snapshot(&self) -> Item<K, V>
    where
        V: Clone,
    {
        Item {
            key: self.key.0.clone(),
            value: self.value.clone(),
            ttl: self.ttl,
            expires_at: self.expires_at,
        }
    }

    /// Convert a detached entry into a snapshot, reusing the owned value.
    pub(crate) fn into_item(self) -> Item<K, V> {
        Item {
            key: self.key.0,
            value: self.value,
            ttl: self.ttl,
            expires_at: self.expires_at,
        }
    }
}

/// A read-only snapshot of a cache entry.
///
/// Snapshots are decoupled from the cache: they stay valid after later
/// mutations but do not observe them. Re-read the cache for live state.
pub struct Item<K, V> {
    key: Arc<K>,
    value: V,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl<K, V> Item<K, V> {
    /// Build a standalone item with no expiration, e.g. from a [`Loader`].
    ///
    /// [`Loader`]: crate::Loader
    pub fn new(key: K, value: V) -> Self {
        Item {
            key: Arc::new(key),
            value,
            ttl: None,
            expires_at: None,
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    /// The TTL the entry was stored with; `None` means it never expires.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Absolute expiration instant as of the snapshot; `None` means never.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if at <= Instant::now())
    }
}

impl<K, V: Clone> Clone for Item<K, V> {
    fn clone(&self) -> Self {
        Item {
            key: self.key.clone(),
            value: self.value.clone(),
            ttl: self.ttl,
            expires_at: self.expires_at,
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Item<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("ttl", &self.ttl)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expiry() {
        let now = Instant::now();
        let mut e = Entry::new(CacheArc::new("k"), 1, None, None);
        assert!(!e.is_expired(now));

        e.expires_at = Some(now);
        assert!(e.is_expired(now));
        assert!(!e.is_expired(now - Duration::from_millis(1)));
    }

    #[test]
    fn item_snapshot_is_detached() {
        let mut e = Entry::new(CacheArc::new("k".to_string()), 10, None, None);
        let item = e.snapshot();
        e.value = 20;
        assert_eq!(*item.value(), 10);
        assert_eq!(item.key(), "k");
        assert_eq!(item.ttl(), None);
        assert!(!item.is_expired());
    }
}
