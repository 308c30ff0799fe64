use std::collections::HashMap;
use std::hash::Hash;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cache::Cache;
use crate::entry::Item;

/// Miss handler consulted by [`Cache::get`] when a key is absent or expired.
///
/// The returned item is handed straight back to the caller; nothing is
/// stored automatically. A loader that wants its result cached calls
/// [`Cache::insert`] on the cache it receives — `get` holds no lock across
/// the call, so that is safe.
pub trait Loader<K, V>: Send + Sync {
    fn load(&self, cache: &Cache<K, V>, key: &K) -> Option<Item<K, V>>;
}

impl<K, V, F> Loader<K, V> for F
where
    F: Fn(&Cache<K, V>, &K) -> Option<Item<K, V>> + Send + Sync,
{
    fn load(&self, cache: &Cache<K, V>, key: &K) -> Option<Item<K, V>> {
        self(cache, key)
    }
}

/// One in-flight load. Followers park on `done` until the leader settles
/// the result.
struct Flight<K, V> {
    state: Mutex<FlightState<K, V>>,
    done: Condvar,
}

struct FlightState<K, V> {
    settled: bool,
    result: Option<Item<K, V>>,
}

impl<K, V> Flight<K, V> {
    fn new() -> Self {
        Flight {
            state: Mutex::new(FlightState {
                settled: false,
                result: None,
            }),
            done: Condvar::new(),
        }
    }
}

/// Single-flight wrapper around a [`Loader`].
///
/// Concurrent loads of the same key collapse into one call to the inner
/// loader: the first caller runs it, the rest wait and receive their own
/// clone of the outcome. A load that finishes before a new caller arrives
/// does not suppress that caller — each flight group is torn down before
/// its waiters are released.
pub struct SuppressedLoader<K, V, L> {
    inner: L,
    flights: Mutex<HashMap<K, Arc<Flight<K, V>>>>,
}

impl<K, V, L> SuppressedLoader<K, V, L> {
    pub fn new(inner: L) -> Self {
        SuppressedLoader {
            inner,
            flights: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<K, V> {
    Leader(Arc<Flight<K, V>>),
    Follower(Arc<Flight<K, V>>),
}

impl<K, V, L> Loader<K, V> for SuppressedLoader<K, V, L>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
    L: Loader<K, V>,
{
    fn load(&self, cache: &Cache<K, V>, key: &K) -> Option<Item<K, V>> {
        let role = {
            let mut flights = self.flights.lock();
            match flights.get(key) {
                Some(flight) => Role::Follower(flight.clone()),
                None => {
                    let flight = Arc::new(Flight::new());
                    flights.insert(key.clone(), flight.clone());
                    Role::Leader(flight)
                }
            }
        };

        match role {
            Role::Leader(flight) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| self.inner.load(cache, key)));
                self.flights.lock().remove(key);
                let result = match outcome {
                    Ok(result) => result,
                    // release the followers empty-handed, then re-raise
                    Err(payload) => {
                        let mut state = flight.state.lock();
                        state.settled = true;
                        flight.done.notify_all();
                        drop(state);
                        resume_unwind(payload);
                    }
                };
                let mut state = flight.state.lock();
                state.settled = true;
                state.result = result.clone();
                flight.done.notify_all();
                drop(state);
                result
            }
            Role::Follower(flight) => {
                let mut state = flight.state.lock();
                while !state.settled {
                    flight.done.wait(&mut state);
                }
                state.result.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn follower_shares_the_leaders_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let slow = move |_: &Cache<String, String>, key: &String| {
            counted.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            Some(Item::new(key.clone(), "loaded".to_string()))
        };
        let loader = SuppressedLoader::new(slow);
        let cache: Cache<String, String> = Cache::new();
        let key = "q".to_string();

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| loader.load(&cache, &key).map(|item| item.into_value()))
                })
                .collect();
            for worker in workers {
                assert_eq!(worker.join().unwrap(), Some("loaded".to_string()));
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finished_flight_does_not_linger() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let loader = SuppressedLoader::new(move |_: &Cache<String, u32>, _: &String| {
            counted.fetch_add(1, Ordering::SeqCst);
            None
        });
        let cache: Cache<String, u32> = Cache::new();

        assert!(loader.load(&cache, &"k".to_string()).is_none());
        assert!(loader.load(&cache, &"k".to_string()).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
