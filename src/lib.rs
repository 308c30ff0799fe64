/*!
An in-process, generic key/value cache with per-entry time-to-live,
capacity-bounded LRU eviction, observer callbacks, and on-demand loading.

Entries live in one arena shared by three coupled structures: a key map, a
recency list (front = most recently used), and a min-heap over expiration
instants. A background driver thread — opt-in via [`Cache::start`] — sleeps
until the earliest expiry, reaps what has lapsed, and notifies eviction
observers; caches that skip the driver can sweep manually with
[`Cache::evict_expired`]. Expired entries are never returned either way.

```
use perishable::{Cache, EvictionReason, Ttl};
use std::time::Duration;

let cache: Cache<String, String> = Cache::builder()
    .capacity(2)
    .default_ttl(Duration::from_secs(60))
    .build();

let _watch = cache.on_eviction(|reason, item| {
    assert_eq!(reason, EvictionReason::CapacityReached);
    assert_eq!(item.key(), "a");
});

cache.insert("a".to_string(), "1".to_string()).unwrap();
cache.insert("b".to_string(), "2".to_string()).unwrap();
// "a" is the least recently used entry, so the third insert displaces it
cache
    .insert_ttl("c".to_string(), "3".to_string(), Ttl::Never)
    .unwrap();

assert_eq!(cache.len(), 2);
assert!(cache.get(&"a".to_string()).is_none());
assert_eq!(cache.metrics().evictions, 1);
```

Misses can be filled on demand by a [`Loader`]; wrap it in
[`SuppressedLoader`] to collapse concurrent loads of the same key into one
call.

The `ahash` feature (enabled by default) backs the internal key index with
`hashbrown`; without it the index falls back to the standard library's
`HashMap`.
*/

mod cache;
mod driver;
mod entry;
mod heap;
mod index;
mod list;
mod loader;
mod metrics;
mod registry;

pub use cache::{Cache, CacheBuilder};
pub use entry::{EvictionReason, Item, Ttl};
pub use loader::{Loader, SuppressedLoader};
pub use metrics::Metrics;
pub use registry::Subscription;

/// Errors surfaced by the insert family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Adding the TTL to the current instant left the clock's representable
    /// range.
    #[error("expiration instant out of bounds")]
    TimeBounds,
}
