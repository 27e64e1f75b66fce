//! Single-resolution deferred values with ordered continuations.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::scheduler::{Scheduler, SchedulerRef};
use crate::step::Step;

type Continuation<V> = Box<dyn FnOnce(V)>;

enum State<V> {
    /// Continuations in registration order
    Pending(Vec<Continuation<V>>),
    Resolved(V),
}

/// Observable lifecycle of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Pending,
    Resolved,
}

/// A value that becomes available exactly once, with continuations chained
/// onto it.
///
/// `Pending --resolve(v)--> Resolved(v)` is the only transition. Every
/// continuation runs exactly once, on the scheduler's queue, after the value
/// is known. Continuations made ready by the same `resolve` fire in the order
/// they were registered; a continuation registered after resolution is
/// queued behind everything already waiting.
///
/// Clones share the same underlying state.
pub struct DeferredChain<V> {
    state: Rc<RefCell<State<V>>>,
    scheduler: SchedulerRef,
}

impl<V> Clone for DeferredChain<V> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<V: Clone + 'static> DeferredChain<V> {
    /// A new pending chain whose continuations run on `scheduler`.
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::attached(scheduler.downgrade())
    }

    /// A chain that is already resolved with `value`.
    pub fn resolved(scheduler: &Scheduler, value: V) -> Self {
        let chain = Self::new(scheduler);
        chain.resolve(value);
        chain
    }

    pub(crate) fn attached(scheduler: SchedulerRef) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Pending(Vec::new()))),
            scheduler,
        }
    }

    /// Supply the chain's value.
    ///
    /// Returns `false` and changes nothing if the chain was already
    /// resolved. Otherwise every waiting continuation is queued, in
    /// registration order; none of them runs before this call returns.
    pub fn resolve(&self, value: V) -> bool {
        let waiting = {
            let mut state = self.state.borrow_mut();
            let waiting = match &mut *state {
                State::Resolved(_) => {
                    debug!("Ignoring resolve on an already resolved chain");
                    return false;
                }
                State::Pending(waiting) => mem::take(waiting),
            };
            *state = State::Resolved(value.clone());
            waiting
        };

        trace!(continuations = waiting.len(), "Chain resolved");
        for continuation in waiting {
            self.schedule(continuation, value.clone());
        }
        true
    }

    /// Chain a continuation onto this value.
    ///
    /// The returned chain resolves with whatever the continuation produces;
    /// if it produces a chain, the returned chain adopts that chain's value.
    pub fn register<U, F>(&self, continuation: F) -> DeferredChain<U>
    where
        U: Clone + 'static,
        F: FnOnce(V) -> Step<U> + 'static,
    {
        let next = DeferredChain::<U>::attached(self.scheduler.clone());
        let downstream = next.clone();

        self.on_resolve(move |value| match continuation(value) {
            Step::Value(out) => {
                downstream.resolve(out);
            }
            Step::Chain(inner) => downstream.adopt(&inner),
        });

        next
    }

    /// Chain a continuation that produces a plain value.
    pub fn then<U, F>(&self, continuation: F) -> DeferredChain<U>
    where
        U: Clone + 'static,
        F: FnOnce(V) -> U + 'static,
    {
        self.register(move |value| Step::Value(continuation(value)))
    }

    /// Chain a continuation that produces another chain, flattening it.
    pub fn then_chain<U, F>(&self, continuation: F) -> DeferredChain<U>
    where
        U: Clone + 'static,
        F: FnOnce(V) -> DeferredChain<U> + 'static,
    {
        self.register(move |value| Step::Chain(continuation(value)))
    }

    pub fn status(&self) -> ChainStatus {
        match &*self.state.borrow() {
            State::Pending(_) => ChainStatus::Pending,
            State::Resolved(_) => ChainStatus::Resolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == ChainStatus::Resolved
    }

    /// The resolved value, if any.
    pub fn peek(&self) -> Option<V> {
        match &*self.state.borrow() {
            State::Pending(_) => None,
            State::Resolved(value) => Some(value.clone()),
        }
    }

    /// Continuations waiting for resolution. Always zero once resolved.
    pub fn pending_continuations(&self) -> usize {
        match &*self.state.borrow() {
            State::Pending(waiting) => waiting.len(),
            State::Resolved(_) => 0,
        }
    }

    /// True if both handles share the same state.
    pub fn same_chain(&self, other: &DeferredChain<V>) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Attach a raw continuation without creating a downstream chain.
    pub(crate) fn on_resolve<F>(&self, continuation: F)
    where
        F: FnOnce(V) + 'static,
    {
        let continuation: Continuation<V> = Box::new(continuation);

        let ready = {
            let mut state = self.state.borrow_mut();
            match &mut *state {
                State::Pending(waiting) => {
                    waiting.push(continuation);
                    None
                }
                State::Resolved(value) => Some((continuation, value.clone())),
            }
        };

        if let Some((continuation, value)) = ready {
            self.schedule(continuation, value);
        }
    }

    /// Resolve this chain with `source`'s eventual value.
    fn adopt(&self, source: &DeferredChain<V>) {
        if self.same_chain(source) {
            warn!("Chain cannot adopt itself; it stays pending");
            return;
        }
        let target = self.clone();
        source.on_resolve(move |value| {
            target.resolve(value);
        });
    }

    fn schedule(&self, continuation: Continuation<V>, value: V) {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.enqueue(move || continuation(value)),
            None => warn!("Scheduler dropped; discarding continuation"),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for DeferredChain<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            State::Pending(waiting) => f
                .debug_struct("DeferredChain")
                .field("status", &ChainStatus::Pending)
                .field("continuations", &waiting.len())
                .finish(),
            State::Resolved(value) => f
                .debug_struct("DeferredChain")
                .field("status", &ChainStatus::Resolved)
                .field("value", value)
                .finish(),
        }
    }
}
