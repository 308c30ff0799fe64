use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

/// Observer table: id to callback, ids handed out from a monotonically
/// increasing counter. Deregistration of an unknown id is a no-op, which is
/// what makes [`Subscription::cancel`] idempotent.
pub(crate) struct Registry<F: ?Sized> {
    table: Mutex<Table<F>>,
}

struct Table<F: ?Sized> {
    callbacks: HashMap<u64, Arc<F>>,
    next_id: u64,
}

impl<F: ?Sized> Registry<F> {
    pub(crate) fn new() -> Self {
        Registry {
            table: Mutex::new(Table {
                callbacks: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub(crate) fn register(&self, callback: Arc<F>) -> u64 {
        let mut table = self.table.lock();
        let id = table.next_id;
        table.next_id += 1;
        table.callbacks.insert(id, callback);
        id
    }

    pub(crate) fn deregister(&self, id: u64) -> bool {
        self.table.lock().callbacks.remove(&id).is_some()
    }

    /// Copy of the current observer set. Delivery iterates the copy, so
    /// observers registered or removed mid-dispatch never invalidate the
    /// iteration and take effect from the next event onward.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.table.lock().callbacks.values().cloned().collect()
    }
}

/// Run one observer callback, containing any panic so the remaining
/// observers in the same dispatch still run.
pub(crate) fn isolate(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!("cache observer panicked during dispatch");
    }
}

/// Deregistration handle returned by `on_insertion` / `on_eviction`.
///
/// Calling [`cancel`](Subscription::cancel) more than once is harmless.
/// Dropping the handle does *not* deregister the callback.
#[must_use = "hold on to the handle if you intend to deregister the callback later"]
pub struct Subscription {
    cancel: Box<dyn Fn() + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl Fn() + Send + Sync + 'static) -> Self {
        Subscription {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(&self) {
        (self.cancel)()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
