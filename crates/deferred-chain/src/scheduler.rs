//! The cooperative task queue that every continuation, timer callback and
//! task poll runs on.
//!
//! One [`Scheduler`] owns one FIFO queue. Jobs are popped one at a time and
//! run to completion; anything a job enqueues lands behind the jobs already
//! waiting. The scheduler is single-threaded and `!Send`: only task wakers
//! cross the `Send` boundary, and they only ever push job ids.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::chain::DeferredChain;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::task::{LocalTask, TaskId};

pub(crate) type Callback = Box<dyn FnOnce()>;

/// An entry in the FIFO queue. Closures stay on the scheduler's thread;
/// the queue only carries their ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Callback(u64),
    Poll(TaskId),
}

pub(crate) type JobQueue = Arc<Mutex<VecDeque<Job>>>;

/// Counters accumulated over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub callbacks_run: u64,
    pub task_polls: u64,
    pub timers_fired: u64,
}

pub(crate) struct Inner {
    pub(crate) config: SchedulerConfig,
    pub(crate) queue: JobQueue,
    callbacks: RefCell<HashMap<u64, Callback>>,
    pub(crate) tasks: RefCell<HashMap<TaskId, LocalTask>>,
    /// Keyed by deadline, then by creation sequence
    pub(crate) timers: RefCell<BTreeMap<(Instant, u64), Callback>>,
    next_id: Cell<u64>,
    stats: Cell<RunStats>,
    /// Set while a drain is popping jobs
    draining: Cell<bool>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let queued = self.queue.lock().len();
        let timers = self.timers.get_mut().len();
        let tasks = self.tasks.get_mut().len();
        if queued > 0 || timers > 0 || tasks > 0 {
            warn!(
                scheduler = %self.config.name,
                queued,
                timers,
                tasks,
                "Scheduler dropped with pending work"
            );
        }
    }
}

/// Handle to a single-threaded FIFO task queue.
///
/// Cloning the handle shares the queue. Create one at process start, hand it
/// to every [`DeferredChain`](crate::DeferredChain), and drain it with
/// [`run_until_idle`](Self::run_until_idle) or [`run`](Self::run) before
/// exiting.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Rc<Inner>,
}

/// Non-owning handle to a [`Scheduler`].
///
/// Chains hold one so they never keep the queue alive. Spawned futures and
/// queued callbacks should capture one too: a strong [`Scheduler`] stored
/// inside the scheduler's own task table is a reference cycle that only
/// [`Scheduler::shutdown`] can break.
#[derive(Clone)]
pub struct SchedulerRef(Weak<Inner>);

impl SchedulerRef {
    pub fn upgrade(&self) -> Option<Scheduler> {
        self.0.upgrade().map(|inner| Scheduler { inner })
    }

    /// A pending chain on the referenced scheduler.
    pub fn chain<V: Clone + 'static>(&self) -> DeferredChain<V> {
        DeferredChain::attached(self.clone())
    }

    /// A chain already resolved with `value`.
    pub fn resolved<V: Clone + 'static>(&self, value: V) -> DeferredChain<V> {
        let chain = self.chain();
        chain.resolve(value);
        chain
    }

    /// Like [`Scheduler::sleep`]. If the scheduler is gone the chain never
    /// resolves.
    pub fn sleep(&self, delay: Duration) -> DeferredChain<()> {
        match self.upgrade() {
            Some(scheduler) => scheduler.sleep(delay),
            None => {
                debug!("Scheduler dropped; sleep will never complete");
                self.chain()
            }
        }
    }
}

/// Clears the draining flag when a drain ends, even by unwinding.
struct DrainGuard<'a>(&'a Cell<bool>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::build(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SchedulerConfig) -> Self {
        debug!(scheduler = %config.name, limit = config.max_tasks_per_drain, "Scheduler created");
        Self {
            inner: Rc::new(Inner {
                config,
                queue: Arc::new(Mutex::new(VecDeque::new())),
                callbacks: RefCell::new(HashMap::new()),
                tasks: RefCell::new(HashMap::new()),
                timers: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(0),
                stats: Cell::new(RunStats::default()),
                draining: Cell::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Push a task to the back of the queue. It runs on a later drain, never
    /// on the caller's stack.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        self.enqueue_boxed(Box::new(task));
    }

    pub(crate) fn enqueue_boxed(&self, task: Callback) {
        let id = self.next_id();
        self.inner.callbacks.borrow_mut().insert(id, task);
        self.inner.queue.lock().push_back(Job::Callback(id));
        trace!(scheduler = %self.inner.config.name, job = id, "Task enqueued");
    }

    /// Run queued tasks in FIFO order until the queue is empty.
    ///
    /// Returns the number of jobs run. Tasks enqueued while draining are run
    /// in the same call. Called from inside a running task it does nothing
    /// and returns `Ok(0)`: the outer drain picks the work up in order.
    pub fn run_until_idle(&self) -> Result<usize, SchedulerError> {
        if self.inner.draining.replace(true) {
            warn!(
                scheduler = %self.inner.config.name,
                "Ignoring re-entrant drain from inside a running task"
            );
            return Ok(0);
        }
        let _guard = DrainGuard(&self.inner.draining);

        let limit = self.inner.config.max_tasks_per_drain;
        let mut ran = 0;

        loop {
            let job = self.inner.queue.lock().pop_front();
            let Some(job) = job else { break };

            if ran == limit {
                self.inner.queue.lock().push_front(job);
                warn!(
                    scheduler = %self.inner.config.name,
                    limit,
                    "Task queue still busy at drain limit"
                );
                return Err(SchedulerError::DrainLimitExceeded { limit });
            }

            self.run_job(job);
            ran += 1;
        }

        if ran > 0 {
            debug!(scheduler = %self.inner.config.name, jobs = ran, "Task queue drained");
        }
        Ok(ran)
    }

    fn run_job(&self, job: Job) {
        match job {
            Job::Callback(id) => {
                let callback = self.inner.callbacks.borrow_mut().remove(&id);
                if let Some(callback) = callback {
                    trace!(job = id, "Running task");
                    callback();
                    self.record(|s| s.callbacks_run += 1);
                }
            }
            Job::Poll(id) => self.poll_task(id),
        }
    }

    /// Drive the scheduler until no tasks and no timers remain.
    ///
    /// Between drains the loop sleeps on tokio's clock until the earliest
    /// timer is due, then queues that timer's callback. Each timer callback
    /// and everything it triggers drains before the next timer fires.
    pub async fn run(&self) -> Result<RunStats, SchedulerError> {
        if self.inner.draining.get() {
            warn!(
                scheduler = %self.inner.config.name,
                "Ignoring scheduler loop started from inside a running task"
            );
            return Ok(self.stats());
        }
        debug!(scheduler = %self.inner.config.name, "Scheduler loop started");

        loop {
            self.run_until_idle()?;

            let Some(deadline) = self.next_deadline() else {
                break;
            };
            tokio::time::sleep_until(deadline).await;
            self.fire_next_timer();
        }

        let stats = self.stats();
        let stalled = self.live_tasks();
        if stalled > 0 {
            debug!(
                scheduler = %self.inner.config.name,
                tasks = stalled,
                "Scheduler loop finished with tasks still awaiting"
            );
        }
        debug!(
            scheduler = %self.inner.config.name,
            callbacks = stats.callbacks_run,
            polls = stats.task_polls,
            timers = stats.timers_fired,
            "Scheduler loop finished"
        );
        Ok(stats)
    }

    /// Drop every queued job, armed timer and live task.
    ///
    /// Breaks reference cycles created by work that captured a strong
    /// [`Scheduler`]. Chains waiting on the discarded work stay pending.
    pub fn shutdown(&self) {
        if self.inner.draining.get() {
            warn!(scheduler = %self.inner.config.name, "Ignoring shutdown from inside a running task");
            return;
        }

        let queued = mem::take(&mut *self.inner.queue.lock());
        let callbacks = mem::take(&mut *self.inner.callbacks.borrow_mut());
        let timers = mem::take(&mut *self.inner.timers.borrow_mut());
        let tasks = mem::take(&mut *self.inner.tasks.borrow_mut());

        if !queued.is_empty() || !timers.is_empty() || !tasks.is_empty() {
            warn!(
                scheduler = %self.inner.config.name,
                queued = queued.len(),
                timers = timers.len(),
                tasks = tasks.len(),
                "Scheduler shut down with pending work"
            );
        }
        // Dropped outside the borrows: captured handles may touch the scheduler.
        drop((callbacks, timers, tasks));
    }

    /// Number of jobs waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// True when nothing is queued and no timer is armed.
    pub fn is_idle(&self) -> bool {
        self.pending_tasks() == 0 && self.pending_timers() == 0
    }

    pub fn stats(&self) -> RunStats {
        self.inner.stats.get()
    }

    pub(crate) fn record(&self, update: impl FnOnce(&mut RunStats)) {
        let mut stats = self.inner.stats.get();
        update(&mut stats);
        self.inner.stats.set(stats);
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    /// A weak handle for capture by spawned futures and queued callbacks.
    pub fn downgrade(&self) -> SchedulerRef {
        SchedulerRef(Rc::downgrade(&self.inner))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.config.name)
            .field("pending_tasks", &self.pending_tasks())
            .field("pending_timers", &self.pending_timers())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let push = move |label: &'static str| -> Callback {
            let sink = sink.clone();
            Box::new(move || sink.borrow_mut().push(label))
        };
        (log, push)
    }

    #[test]
    fn enqueue_never_runs_inline() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        scheduler.enqueue(push("a"));
        assert!(log.borrow().is_empty());
        assert_eq!(scheduler.pending_tasks(), 1);

        assert_eq!(scheduler.run_until_idle().unwrap(), 1);
        assert_eq!(*log.borrow(), vec!["a"]);
        assert!(scheduler.is_idle());
    }

    #[test]
    fn drains_in_fifo_order() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        for label in ["a", "b", "c"] {
            scheduler.enqueue(push(label));
        }
        scheduler.run_until_idle().unwrap();

        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn nested_enqueue_runs_after_existing_tasks() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        let inner_task = push("nested");
        let handle = scheduler.clone();
        let first = push("first");
        scheduler.enqueue(move || {
            first();
            handle.enqueue(inner_task);
        });
        scheduler.enqueue(push("second"));

        assert_eq!(scheduler.run_until_idle().unwrap(), 3);
        assert_eq!(*log.borrow(), vec!["first", "second", "nested"]);
    }

    #[test]
    fn drain_limit_stops_runaway_rescheduling() {
        fn forever(scheduler: Scheduler) {
            let next = scheduler.clone();
            scheduler.enqueue(move || forever(next));
        }

        let scheduler = Scheduler::with_config(SchedulerConfig::strict(8)).unwrap();
        forever(scheduler.clone());

        let err = scheduler.run_until_idle().unwrap_err();
        assert_eq!(err, SchedulerError::DrainLimitExceeded { limit: 8 });
        // The job that tripped the limit is still queued.
        assert_eq!(scheduler.pending_tasks(), 1);
    }

    #[test]
    fn nested_drain_from_running_task_is_ignored() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();
        let nested = Rc::new(Cell::new(None));

        let handle = scheduler.downgrade();
        let seen = nested.clone();
        let first = push("first");
        let after = push("first-after-nested-drain");
        scheduler.enqueue(move || {
            first();
            if let Some(scheduler) = handle.upgrade() {
                seen.set(scheduler.run_until_idle().ok());
            }
            after();
        });
        scheduler.enqueue(push("second"));

        assert_eq!(scheduler.run_until_idle().unwrap(), 2);
        assert_eq!(nested.get(), Some(0));
        assert_eq!(
            *log.borrow(),
            vec!["first", "first-after-nested-drain", "second"]
        );
    }

    #[tokio::test]
    async fn run_from_inside_a_task_returns_without_driving() {
        let scheduler = Scheduler::new();
        let handle = scheduler.downgrade();

        let out = scheduler.spawn(async move {
            match handle.upgrade() {
                Some(scheduler) => scheduler.run().await.map(|stats| stats.task_polls).ok(),
                None => None,
            }
        });
        scheduler.run().await.unwrap();

        assert_eq!(out.peek(), Some(Some(1)));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn shutdown_discards_queued_work_and_timers() {
        let scheduler = Scheduler::new();
        let (log, push) = recorder();

        scheduler.enqueue(push("dropped"));
        scheduler.set_timeout(Duration::from_millis(10), push("never"));
        scheduler.shutdown();

        assert!(scheduler.is_idle());
        assert_eq!(scheduler.run_until_idle().unwrap(), 0);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(Scheduler::with_config(SchedulerConfig::strict(0)).is_err());
    }

    #[test]
    fn stats_count_callbacks() {
        let scheduler = Scheduler::new();
        scheduler.enqueue(|| {});
        scheduler.enqueue(|| {});
        scheduler.run_until_idle().unwrap();

        assert_eq!(scheduler.stats().callbacks_run, 2);
        assert_eq!(scheduler.stats().task_polls, 0);
    }

    #[tokio::test]
    async fn run_with_no_work_returns_immediately() {
        let scheduler = Scheduler::new();
        let stats = scheduler.run().await.unwrap();
        assert_eq!(stats, RunStats::default());
    }
}
