//! One-shot timers, the only external trigger a chain responds to.
//!
//! A timer never runs its callback directly: when it comes due, the
//! scheduler loop moves the callback onto the FIFO queue, so it is ordered
//! against everything else by arrival.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::chain::DeferredChain;
use crate::scheduler::Scheduler;

/// Roughly 30 years out. Delays past the clock's range are armed here.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Identifies an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl Scheduler {
    /// Run `callback` once, no earlier than `delay` from now.
    ///
    /// Timers with equal deadlines fire in the order they were armed. Only
    /// [`run`](Scheduler::run) fires timers.
    pub fn set_timeout<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce() + 'static,
    {
        let seq = self.next_id();
        let deadline = Instant::now().checked_add(delay).unwrap_or_else(far_future);
        self.inner
            .timers
            .borrow_mut()
            .insert((deadline, seq), Box::new(callback));
        trace!(timer = seq, ?delay, "Timer armed");
        TimerId(seq)
    }

    /// A chain that resolves with `()` after `delay`.
    pub fn sleep(&self, delay: Duration) -> DeferredChain<()> {
        let chain = DeferredChain::new(self);
        self.resolve_after(&chain, (), delay);
        chain
    }

    /// Resolve `chain` with `value` once `delay` has elapsed.
    pub fn resolve_after<V>(&self, chain: &DeferredChain<V>, value: V, delay: Duration) -> TimerId
    where
        V: Clone + 'static,
    {
        let chain = chain.clone();
        self.set_timeout(delay, move || {
            chain.resolve(value);
        })
    }

    /// Number of timers that have not fired yet.
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .timers
            .borrow()
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Move the earliest timer's callback onto the task queue.
    pub(crate) fn fire_next_timer(&self) {
        let next = self.inner.timers.borrow_mut().pop_first();
        if let Some(((_, seq), callback)) = next {
            debug!(timer = seq, "Timer fired");
            self.enqueue_boxed(callback);
            self.record(|s| s.timers_fired += 1);
        }
    }
}
