use std::hash::Hash;
use std::time::{Duration, Instant};

#[cfg(feature = "ahash")]
use hashbrown::HashMap;

#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

use crate::entry::{CacheArc, Entry};
use crate::heap::ExpiryQueue;
use crate::list::LruList;

/// Outcome of an upsert: the entry's arena slot, tagged with whether the
/// key was new to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Upsert {
    Inserted(usize),
    Updated(usize),
}

impl Upsert {
    pub(crate) fn slot(self) -> usize {
        match self {
            Upsert::Inserted(slot) | Upsert::Updated(slot) => slot,
        }
    }
}

/// The coupled structures behind the cache: a key map, the recency list
/// arena that owns every entry, and the expiry heap. The three are mutated
/// together under the facade's write lock; at every return from a public
/// method of this type a key is in the map iff its entry is in the list,
/// and iff it is in the heap when it carries an expiry.
pub(crate) struct EntryIndex<K, V> {
    values: HashMap<CacheArc<K>, usize>,
    order: LruList<Entry<K, V>>,
    expiry: ExpiryQueue,
    capacity: usize,
}

impl<K, V> EntryIndex<K, V> {
    /// `capacity` of zero means unbounded.
    pub(crate) fn new(capacity: usize) -> Self {
        EntryIndex {
            values: HashMap::with_capacity(capacity),
            order: LruList::with_capacity(capacity),
            expiry: ExpiryQueue::new(),
            capacity,
        }
    }
}

impl<K: Eq + Hash, V> EntryIndex<K, V> {
    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    pub(crate) fn slot_of(&self, key: &K) -> Option<usize> {
        self.values.get(key).copied()
    }

    pub(crate) fn entry(&self, slot: usize) -> &Entry<K, V> {
        self.order.get(slot)
    }

    /// Earliest scheduled expiry across all entries.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.expiry.peek().map(|(at, _)| at)
    }

    /// Entries front (MRU) to back (LRU).
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Entry<K, V>> {
        self.order.iter()
    }

    /// Insert or update `key`. An update keeps the entry's identity: value,
    /// TTL, and expiry are replaced, the entry moves to the recency front,
    /// and its heap membership is corrected. A brand-new key at capacity
    /// first displaces the recency back, which is returned as the victim so
    /// the caller can report a capacity eviction; the new entry is never
    /// its own victim.
    pub(crate) fn upsert(
        &mut self,
        key: K,
        value: V,
        ttl: Option<Duration>,
        expires_at: Option<Instant>,
    ) -> (Upsert, Option<Entry<K, V>>) {
        if let Some(slot) = self.slot_of(&key) {
            let old_heap = {
                let entry = self.order.get_mut(slot);
                entry.value = value;
                entry.ttl = ttl;
                entry.expires_at = expires_at;
                entry.heap_slot
            };
            self.reschedule(slot, old_heap, expires_at);
            self.order.move_to_front(slot);
            return (Upsert::Updated(slot), None);
        }

        let victim = if self.capacity > 0 && self.values.len() == self.capacity {
            self.order.back().map(|back| self.detach(back))
        } else {
            None
        };

        let key = CacheArc::new(key);
        let slot = self
            .order
            .push_front(Entry::new(key.clone(), value, ttl, expires_at));
        self.values.insert(key, slot);
        if let Some(at) = expires_at {
            let Self { order, expiry, .. } = self;
            expiry.push(at, slot, |s, p| order.get_mut(s).heap_slot = Some(p));
        }
        (Upsert::Inserted(slot), victim)
    }

    /// Remove `slot` from all three structures and hand back the entry.
    pub(crate) fn detach(&mut self, slot: usize) -> Entry<K, V> {
        let mut entry = self.order.remove(slot);
        if let Some(position) = entry.heap_slot.take() {
            let Self { order, expiry, .. } = self;
            expiry.remove(position, |s, p| order.get_mut(s).heap_slot = Some(p));
        }
        self.values.remove(entry.key());
        entry
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<Entry<K, V>> {
        self.slot_of(key).map(|slot| self.detach(slot))
    }

    /// Detach every entry, front to back.
    pub(crate) fn take_all(&mut self) -> Vec<Entry<K, V>> {
        let mut drained = Vec::with_capacity(self.values.len());
        while let Some(slot) = self.order.front() {
            drained.push(self.detach(slot));
        }
        drained
    }

    /// Pop every entry whose expiry has passed, walking the heap root.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Entry<K, V>> {
        let mut reaped = Vec::new();
        while let Some((at, slot)) = self.expiry.peek() {
            if at > now {
                break;
            }
            reaped.push(self.detach(slot));
        }
        reaped
    }

    pub(crate) fn promote(&mut self, slot: usize) {
        self.order.move_to_front(slot);
    }

    /// Re-arm `slot`'s expiry at `now + ttl`. Entries without a TTL are
    /// untouched, as are entries whose new expiry is not representable.
    pub(crate) fn extend(&mut self, slot: usize, now: Instant) {
        let (ttl, old_heap) = {
            let entry = self.order.get(slot);
            (entry.ttl, entry.heap_slot)
        };
        let Some(at) = ttl.and_then(|ttl| now.checked_add(ttl)) else {
            return;
        };
        self.order.get_mut(slot).expires_at = Some(at);
        self.reschedule(slot, old_heap, Some(at));
    }

    /// Bring the heap in line with `slot`'s new expiry, given where the
    /// entry sat before.
    fn reschedule(&mut self, slot: usize, old_heap: Option<usize>, expires_at: Option<Instant>) {
        let Self { order, expiry, .. } = self;
        let mut reindex = |s: usize, p: usize| order.get_mut(s).heap_slot = Some(p);
        match (old_heap, expires_at) {
            (Some(position), Some(at)) => expiry.update(position, at, reindex),
            (Some(position), None) => {
                expiry.remove(position, &mut reindex);
                order.get_mut(slot).heap_slot = None;
            }
            (None, Some(at)) => expiry.push(at, slot, reindex),
            (None, None) => {}
        }
    }

    #[cfg(test)]
    fn assert_coherent(&self) {
        assert_eq!(self.values.len(), self.order.len());
        if self.capacity > 0 {
            assert!(self.values.len() <= self.capacity);
        }
        let mut scheduled = 0;
        for entry in self.order.iter() {
            let slot = *self.values.get(entry.key()).expect("entry missing from map");
            assert!(std::ptr::eq(self.order.get(slot), entry));
            match (entry.expires_at, entry.heap_slot) {
                (Some(at), Some(position)) => {
                    assert_eq!(self.expiry.as_slice()[position], (at, slot));
                    scheduled += 1;
                }
                (None, None) => {}
                other => panic!("expiry/heap mismatch: {other:?}"),
            }
        }
        assert_eq!(self.expiry.len(), scheduled);
        for (i, &(at, _)) in self.expiry.as_slice().iter().enumerate() {
            if i > 0 {
                assert!(self.expiry.as_slice()[(i - 1) / 2].0 <= at);
            }
        }
    }
}
