/*!
Full tests of the public cache surface
*/

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use perishable::{Cache, Error, EvictionReason, Item, SuppressedLoader, Ttl};

type EvictionLog = Arc<Mutex<Vec<(EvictionReason, String)>>>;

fn watch_evictions(cache: &Cache<&'static str, u32>) -> EvictionLog {
    let log: EvictionLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    // the subscription stays registered for the cache's lifetime
    let _ = cache.on_eviction(move |reason, item| {
        sink.lock().push((reason, item.key().to_string()));
    });
    log
}

#[test]
fn round_trip_without_ttl() {
    let cache: Cache<&str, String> = Cache::new();
    cache.insert_ttl("k", "v".to_string(), Ttl::Never).unwrap();

    let item = cache.get(&"k").unwrap();
    assert_eq!(item.value(), "v");
    assert_eq!(item.expires_at(), None);
    assert_eq!(item.ttl(), None);

    // touch-on-hit has nothing to extend
    let again = cache.get(&"k").unwrap();
    assert_eq!(again.expires_at(), None);

    let metrics = cache.metrics();
    assert_eq!(metrics.insertions, 1);
    assert_eq!(metrics.hits, 2);
    assert_eq!(metrics.misses, 0);
}

#[test]
fn update_keeps_insertions_flat() {
    let cache: Cache<&str, u32> = Cache::new();
    cache.insert("k", 1).unwrap();
    cache.insert("k", 2).unwrap();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&"k").unwrap().into_value(), 2);
    assert_eq!(cache.metrics().insertions, 1);
}

#[test]
fn lru_order_follows_use() {
    let cache: Cache<&str, u32> = Cache::new();
    cache.insert("a", 1).unwrap();
    cache.insert("b", 2).unwrap();
    cache.insert("c", 3).unwrap();

    cache.get(&"a").unwrap();
    assert_eq!(cache.keys(), ["a", "c", "b"]);
}

#[test]
fn capacity_two_evicts_first_in() {
    let cache: Cache<&str, u32> = Cache::builder().capacity(2).build();
    let log = watch_evictions(&cache);

    cache.insert("a", 1).unwrap();
    cache.insert("b", 2).unwrap();
    cache.insert("c", 3).unwrap();

    assert_eq!(cache.len(), 2);
    assert!(cache.get(&"a").is_none());
    assert_eq!(
        *log.lock(),
        [(EvictionReason::CapacityReached, "a".to_string())]
    );
}

#[test]
fn capacity_eviction_end_to_end() {
    let cache: Cache<&str, u32> = Cache::builder()
        .capacity(3)
        .default_ttl(Duration::from_secs(3600))
        .build();
    let log = watch_evictions(&cache);

    for (i, key) in ["1", "2", "3", "4"].into_iter().enumerate() {
        cache.insert(key, i as u32).unwrap();
    }

    assert_eq!(cache.keys(), ["4", "3", "2"]);
    assert_eq!(
        *log.lock(),
        [(EvictionReason::CapacityReached, "1".to_string())]
    );
    let metrics = cache.metrics();
    assert_eq!(metrics.insertions, 4);
    assert_eq!(metrics.evictions, 1);
}

#[test]
fn remove_is_idempotent() {
    let cache: Cache<&str, u32> = Cache::new();
    let log = watch_evictions(&cache);
    cache.insert("k", 1).unwrap();

    cache.remove(&"k");
    cache.remove(&"k");

    assert_eq!(cache.len(), 0);
    assert_eq!(cache.metrics().evictions, 1);
    assert_eq!(*log.lock(), [(EvictionReason::Deleted, "k".to_string())]);
}

#[test]
fn clear_reports_every_entry_deleted() {
    let cache: Cache<&str, u32> = Cache::new();
    let log = watch_evictions(&cache);
    cache.insert("a", 1).unwrap();
    cache.insert("b", 2).unwrap();
    cache.insert("c", 3).unwrap();

    cache.clear();

    assert!(cache.is_empty());
    let log = log.lock();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|(reason, _)| *reason == EvictionReason::Deleted));
    assert_eq!(cache.metrics().evictions, 3);
}

#[test]
fn expired_entries_vanish_before_any_sweep() {
    let cache: Cache<&str, u32> = Cache::builder()
        .default_ttl(Duration::from_millis(30))
        .build();
    cache.insert("k", 1).unwrap();
    sleep(Duration::from_millis(80));

    // the entry is dead to lookups but still occupies the index
    assert!(cache.get(&"k").is_none());
    assert!(!cache.contains_key(&"k"));
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.metrics().misses, 1);
}

#[test]
fn manual_sweep_reaps_expired() {
    let cache: Cache<&str, u32> = Cache::builder()
        .default_ttl(Duration::from_millis(20))
        .build();
    let log = watch_evictions(&cache);
    cache.insert("short", 1).unwrap();
    cache.insert_ttl("long", 2, Ttl::After(Duration::from_secs(3600))).unwrap();

    sleep(Duration::from_millis(60));
    cache.evict_expired();

    assert_eq!(cache.len(), 1);
    assert!(cache.contains_key(&"long"));
    assert_eq!(
        *log.lock(),
        [(EvictionReason::Expired, "short".to_string())]
    );
    assert_eq!(cache.metrics().evictions, 1);
}

#[test]
fn hit_extends_expiry() {
    let cache: Cache<&str, u32> = Cache::builder()
        .default_ttl(Duration::from_millis(300))
        .build();
    let first = cache.insert("a", 1).unwrap();

    sleep(Duration::from_millis(150));
    let refreshed = cache.get(&"a").unwrap();

    assert!(refreshed.expires_at().unwrap() > first.expires_at().unwrap());
    let remaining = refreshed
        .expires_at()
        .unwrap()
        .saturating_duration_since(Instant::now());
    // re-armed to a full TTL just now; without the refresh at most half is left
    assert!(remaining > Duration::from_millis(180), "remaining {remaining:?}");
}

#[test]
fn touch_on_hit_can_be_disabled() {
    let cache: Cache<&str, u32> = Cache::builder()
        .default_ttl(Duration::from_millis(300))
        .touch_on_hit(false)
        .build();
    let first = cache.insert("a", 1).unwrap();

    sleep(Duration::from_millis(50));
    let unrefreshed = cache.get(&"a").unwrap();
    assert_eq!(unrefreshed.expires_at(), first.expires_at());
}

#[test]
fn touch_promotes_and_rearms() {
    let cache: Cache<&str, u32> = Cache::builder()
        .default_ttl(Duration::from_millis(200))
        .build();
    let first = cache.insert("a", 1).unwrap();
    cache.insert("b", 2).unwrap();

    sleep(Duration::from_millis(20));
    cache.touch(&"a");

    assert_eq!(cache.keys(), ["a", "b"]);
    let after = cache.items()[&"a"].expires_at().unwrap();
    assert!(after > first.expires_at().unwrap());

    // missing keys are a no-op
    cache.touch(&"nope");
    assert_eq!(cache.len(), 2);
}

#[test]
fn items_is_a_decoupled_copy() {
    let cache: Cache<&str, u32> = Cache::new();
    cache.insert("a", 1).unwrap();
    cache.insert("b", 2).unwrap();

    let items = cache.items();
    cache.insert("a", 99).unwrap();
    cache.remove(&"b");

    assert_eq!(items.len(), 2);
    assert_eq!(*items[&"a"].value(), 1);
    assert_eq!(*items[&"b"].value(), 2);
}

#[test]
fn get_and_remove_still_notifies() {
    let cache: Cache<&str, u32> = Cache::new();
    let log = watch_evictions(&cache);
    cache.insert("k", 7).unwrap();

    let taken = cache.get_and_remove(&"k").unwrap();
    assert_eq!(taken.into_value(), 7);
    assert!(cache.get_and_remove(&"k").is_none());

    assert!(cache.is_empty());
    assert_eq!(*log.lock(), [(EvictionReason::Deleted, "k".to_string())]);
}

#[test]
fn get_or_insert_with_runs_once() {
    let cache: Cache<&str, u32> = Cache::new();

    let made = cache
        .get_or_insert_with("k", Ttl::Default, || 5)
        .unwrap();
    assert_eq!(*made.value(), 5);

    let found = cache
        .get_or_insert_with("k", Ttl::Default, || panic!("value already present"))
        .unwrap();
    assert_eq!(*found.value(), 5);

    let metrics = cache.metrics();
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.insertions, 1);
}

#[test]
fn oversized_ttl_is_rejected() {
    let cache: Cache<&str, u32> = Cache::new();
    let res = cache.insert_ttl("k", 1, Ttl::After(Duration::MAX));
    assert_eq!(res.unwrap_err(), Error::TimeBounds);
    assert!(cache.is_empty());
}

#[test]
fn insertion_observer_deregistration() {
    let cache: Cache<&str, u32> = Cache::new();
    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let counted = first_hits.clone();
    let first = cache.on_insertion(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let counted = second_hits.clone();
    let _second = cache.on_insertion(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    first.cancel();
    first.cancel();
    cache.insert("k", 1).unwrap();

    assert_eq!(first_hits.load(Ordering::SeqCst), 0);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_observer_does_not_block_the_rest() {
    let cache: Cache<&str, u32> = Cache::new();
    let _bad = cache.on_insertion(|_| panic!("observer bug"));
    let reached = Arc::new(AtomicUsize::new(0));
    let counted = reached.clone();
    let _good = cache.on_insertion(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });

    cache.insert("k", 1).unwrap();
    assert_eq!(reached.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn driver_reaps_on_schedule() {
    let cache: Cache<&str, u32> = Cache::new();
    let log = watch_evictions(&cache);
    cache.start();

    cache
        .insert_ttl("x", 1, Ttl::After(Duration::from_millis(40)))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.len() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }
    cache.stop();

    assert_eq!(cache.len(), 0);
    assert_eq!(*log.lock(), [(EvictionReason::Expired, "x".to_string())]);
    assert_eq!(cache.metrics().evictions, 1);
}

#[test]
fn driver_prefers_the_earlier_expiry() {
    let cache: Cache<&str, u32> = Cache::new();
    let log = watch_evictions(&cache);
    cache.start();

    // the later entry arrives first; the hint for the earlier one must
    // preempt the driver's sleep
    cache
        .insert_ttl("slow", 1, Ttl::After(Duration::from_millis(600)))
        .unwrap();
    cache
        .insert_ttl("fast", 2, Ttl::After(Duration::from_millis(40)))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while log.lock().is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }

    {
        let log = log.lock();
        assert_eq!(log.first(), Some(&(EvictionReason::Expired, "fast".to_string())));
    }
    assert!(cache.contains_key(&"slow"));

    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.len() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }
    cache.stop();
    assert_eq!(cache.len(), 0);
}

#[test]
fn start_and_stop_are_idempotent() {
    let cache: Cache<&str, u32> = Cache::new();
    cache.start();
    cache.start();
    cache.stop();
    cache.stop();

    // the driver can be restarted after a stop
    cache.start();
    cache
        .insert_ttl("x", 1, Ttl::After(Duration::from_millis(30)))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while cache.len() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(10));
    }
    cache.stop();
    assert_eq!(cache.len(), 0);
}

#[test]
fn loader_fills_misses_without_caching() {
    let cache: Cache<String, String> = Cache::builder()
        .loader(|_: &Cache<String, String>, key: &String| {
            Some(Item::new(key.clone(), "loaded".to_string()))
        })
        .build();

    let item = cache.get(&"z".to_string()).unwrap();
    assert_eq!(item.value(), "loaded");

    // nothing was stored on the cache's behalf
    assert_eq!(cache.len(), 0);
    let metrics = cache.metrics();
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hits, 0);
}

#[test]
fn loader_may_insert_into_the_cache() {
    let cache: Cache<String, String> = Cache::builder()
        .loader(|cache: &Cache<String, String>, key: &String| {
            cache.insert(key.clone(), "cached".to_string()).ok()
        })
        .build();

    assert_eq!(cache.get(&"z".to_string()).unwrap().value(), "cached");
    assert_eq!(cache.len(), 1);
    // present now, so the loader is out of the picture
    assert_eq!(cache.get(&"z".to_string()).unwrap().value(), "cached");
    assert_eq!(cache.metrics().hits, 1);
}

#[test]
fn suppressed_loader_collapses_concurrent_misses() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let slow = move |_: &Cache<String, String>, key: &String| {
        counted.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(100));
        Some(Item::new(key.clone(), "v".to_string()))
    };
    let cache: Cache<String, String> = Cache::builder()
        .loader(SuppressedLoader::new(slow))
        .build();

    let mut values = Vec::new();
    std::thread::scope(|scope| {
        let workers: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                scope.spawn(move || {
                    cache
                        .get(&"q".to_string())
                        .map(|item| item.into_value())
                })
            })
            .collect();
        for worker in workers {
            values.push(worker.join().unwrap());
        }
    });

    assert_eq!(values, [Some("v".to_string()), Some("v".to_string())]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().misses, 2);
}

#[test]
fn concurrent_mutators_converge() {
    let cache: Cache<String, u32> = Cache::builder().capacity(64).build();
    cache.start();

    std::thread::scope(|scope| {
        for worker in 0..4u32 {
            let cache = cache.clone();
            scope.spawn(move || {
                for i in 0..200u32 {
                    let key = format!("k{}", (worker * 200 + i) % 97);
                    match i % 4 {
                        0 => {
                            cache
                                .insert_ttl(key, i, Ttl::After(Duration::from_millis(20)))
                                .unwrap();
                        }
                        1 => {
                            cache.insert(key, i).unwrap();
                        }
                        2 => {
                            cache.get(&key);
                        }
                        _ => cache.remove(&key),
                    }
                }
            });
        }
    });
    cache.stop();

    assert!(cache.len() <= 64);
    assert!(cache.metrics().insertions > 0);
}
