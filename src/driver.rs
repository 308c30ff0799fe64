use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::cache::Shared;

/// Mailbox between mutators and the expiration driver: a single pending
/// wake instant plus the stop flag, with a condvar to preempt the driver's
/// sleep. Competing hints merge by taking the minimum, so the driver can
/// wake early but never oversleeps the true earliest expiry.
pub(crate) struct TimerHint {
    slot: Mutex<HintSlot>,
    cond: Condvar,
}

#[derive(Default)]
struct HintSlot {
    wake: Option<Instant>,
    stopped: bool,
}

impl TimerHint {
    pub(crate) fn new() -> Self {
        TimerHint {
            slot: Mutex::new(HintSlot::default()),
            cond: Condvar::new(),
        }
    }

    /// Ask the driver to be awake by `at`.
    pub(crate) fn propose(&self, at: Instant) {
        let mut slot = self.slot.lock();
        slot.wake = Some(match slot.wake {
            Some(pending) => pending.min(at),
            None => at,
        });
        self.cond.notify_one();
    }

    pub(crate) fn halt(&self) {
        let mut slot = self.slot.lock();
        slot.stopped = true;
        self.cond.notify_all();
    }

    /// Re-arm the mailbox for a fresh driver. Any hint left over from the
    /// previous run is dropped; the new driver reads the heap directly.
    pub(crate) fn resume(&self) {
        let mut slot = self.slot.lock();
        slot.stopped = false;
        slot.wake = None;
    }
}

/// The expiration driver loop.
///
/// Sleeps until the earliest known expiry (or indefinitely while nothing
/// expires), absorbing hints that move the deadline up. On deadline it
/// sweeps the expired heap prefix under the write lock, delivers the
/// eviction events with no lock held, and re-arms from the new heap head.
///
/// The loop holds the cache only weakly between wakes; when every cache
/// handle is gone the shared state's teardown flags the mailbox and the
/// thread unwinds on its own.
pub(crate) fn run<K, V>(shared: Weak<Shared<K, V>>, hint: Arc<TimerHint>)
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    tracing::debug!("expiration driver started");
    let mut deadline = match shared.upgrade() {
        Some(shared) => shared.next_expiry(),
        None => return,
    };

    loop {
        {
            let mut slot = hint.slot.lock();
            loop {
                if slot.stopped {
                    tracing::debug!("expiration driver stopped");
                    return;
                }
                if let Some(at) = slot.wake.take() {
                    deadline = Some(deadline.map_or(at, |current| current.min(at)));
                }
                match deadline {
                    None => hint.cond.wait(&mut slot),
                    Some(at) => {
                        if Instant::now() >= at {
                            break;
                        }
                        hint.cond.wait_until(&mut slot, at);
                    }
                }
            }
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        let now = Instant::now();
        let (events, next) = shared.sweep(now);
        if !events.is_empty() {
            tracing::trace!(expired = events.len(), "expiry sweep");
        }
        deadline = next;
        shared.deliver(events);
    }
}
